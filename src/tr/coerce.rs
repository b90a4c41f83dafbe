//! Implicit domain reconciliation.
//!
//! The two adapters here are the single source of truth for implicit
//! conversions: `coerce_unary` validates and specializes a lone domain,
//! `coerce_binary` finds the least domain covering a pair.  All cast
//! insertion upstream relies on them.

use crate::domain::Domain;

/// Validates and specializes a domain; `None` when the domain cannot
/// appear in a regular expression.
pub fn coerce_unary(domain: &Domain) -> Option<Domain> {
    match domain {
        // Special domains are not coercible.
        Domain::Void
        | Domain::List(_)
        | Domain::Record(_)
        | Domain::Entity(_)
        | Domain::Identity(_) => None,
        // Untyped top-level expressions specialize to text.
        Domain::Untyped => Some(Domain::text()),
        _ => Some(domain.clone()),
    }
}

/// The least domain covering both arguments; `None` when the domains are
/// incompatible.
pub fn coerce_binary(ldomain: &Domain, rdomain: &Domain) -> Option<Domain> {
    use Domain::*;
    Some(match (ldomain, rdomain) {
        (Boolean, Boolean) | (Boolean, Untyped) | (Untyped, Boolean) => Boolean,
        (Integer, Integer) | (Integer, Untyped) | (Untyped, Integer) => Integer,
        (Decimal { .. }, Decimal { .. })
        | (Decimal { .. }, Integer)
        | (Integer, Decimal { .. })
        | (Decimal { .. }, Untyped)
        | (Untyped, Decimal { .. }) => Domain::decimal(),
        (Float, Float)
        | (Float, Decimal { .. })
        | (Decimal { .. }, Float)
        | (Float, Integer)
        | (Integer, Float)
        | (Float, Untyped)
        | (Untyped, Float) => Float,
        (Text { .. }, Text { .. }) | (Text { .. }, Untyped) | (Untyped, Text { .. }) => {
            Domain::text()
        }
        // Only equal enum domains are compatible.
        (Enum(llabels), Enum(rlabels)) if llabels == rlabels => ldomain.clone(),
        (Enum(_), Untyped) => ldomain.clone(),
        (Untyped, Enum(_)) => rdomain.clone(),
        (Date, Date) | (Date, Untyped) | (Untyped, Date) => Date,
        (Time, Time) | (Time, Untyped) | (Untyped, Time) => Time,
        (DateTime, DateTime) | (DateTime, Untyped) | (Untyped, DateTime) => DateTime,
        (Untyped, Untyped) => Untyped,
        // Opaque domains are compatible only when equal.
        (Opaque, Opaque) => Opaque,
        (left, right) if left == right => ldomain.clone(),
        _ => return None,
    })
}

/// Reduces a list of domains to a single common domain: a left fold of
/// `coerce_binary` finished with `coerce_unary`.
pub fn coerce<'a, I>(domains: I) -> Option<Domain>
where
    I: IntoIterator<Item = &'a Domain>,
{
    let mut domains = domains.into_iter();
    let mut common = domains.next()?.clone();
    for domain in domains {
        common = coerce_binary(&common, domain)?;
    }
    coerce_unary(&common)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn untyped_specializes_against_a_partner() {
        assert_eq!(coerce_binary(&Domain::Boolean, &Domain::Untyped), Some(Domain::Boolean));
        assert_eq!(coerce_binary(&Domain::Untyped, &Domain::Integer), Some(Domain::Integer));
    }

    #[test]
    fn numeric_tower_widens() {
        assert_eq!(
            coerce_binary(&Domain::Integer, &Domain::decimal()),
            Some(Domain::decimal())
        );
        assert_eq!(coerce_binary(&Domain::decimal(), &Domain::Float), Some(Domain::Float));
        assert_eq!(coerce_binary(&Domain::Integer, &Domain::Float), Some(Domain::Float));
    }

    #[test]
    fn incompatible_domains_do_not_coerce() {
        assert_eq!(coerce_binary(&Domain::Boolean, &Domain::Integer), None);
        assert_eq!(coerce_binary(&Domain::Date, &Domain::Time), None);
        assert_eq!(
            coerce_binary(
                &Domain::Enum(vec!["ba".into()]),
                &Domain::Enum(vec!["ms".into()])
            ),
            None
        );
    }

    #[test]
    fn unary_rejects_special_domains() {
        assert_eq!(coerce_unary(&Domain::Void), None);
        assert_eq!(coerce_unary(&Domain::List(Box::new(Domain::Integer))), None);
        assert_eq!(coerce_unary(&Domain::Untyped), Some(Domain::text()));
    }

    #[test]
    fn coerce_folds_left_to_right() {
        let domains = [Domain::Integer, Domain::Untyped, Domain::decimal()];
        assert_eq!(coerce(&domains), Some(Domain::decimal()));
        let clash = [Domain::Integer, Domain::Boolean];
        assert_eq!(coerce(&clash), None);
    }
}
