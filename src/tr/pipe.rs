//! The executable plan: SQL statements plus row-shaping operators.
//!
//! Pipes are plain data interpreted by [execute]; keeping them as data
//! (rather than closures) preserves serialization and inspection of
//! compiled plans.  The compiler performs no I/O: SQL statements are
//! submitted through the caller-supplied [Database] trait, under a
//! scoped [Transaction] guard that commits on success and rolls back
//! otherwise.

use serde::Serialize;

use crate::domain::{Data, Domain, Profile, Value};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, strum::AsRefStr)]
pub enum Pipe {
    /// Produces a constant.
    Value(Data),
    /// Extracts a field of the input record; a negative index counts
    /// from the end.
    Extract(isize),
    /// Builds a record by applying each field pipe to the input.
    Record(Vec<Pipe>),
    /// Maps the inner pipe over a list.
    Iterate(Box<Pipe>),
    /// Function composition, left first.
    Compose(Box<Pipe>, Box<Pipe>),
    /// NULL-collapses records whose indicator is not true.
    Annihilate { test: Box<Pipe>, value: Box<Pipe> },
    /// Asserts at most one row and unwraps it.
    Single,
    /// Merge-joins a parent result with per-key child results; both
    /// sides must be sorted on the merge keys.
    Mix { keys: Vec<Pipe> },
    /// Runs a SQL statement and returns its rows.
    Sql {
        sql: String,
        input: Option<Vec<Domain>>,
        output: Vec<Domain>,
    },
    /// Like [Pipe::Sql], with a fetch-size hint for streaming
    /// executors.
    BatchSql {
        sql: String,
        input: Option<Vec<Domain>>,
        output: Vec<Domain>,
        batch: usize,
    },
}

impl Pipe {
    pub fn compose(self, right: Pipe) -> Pipe {
        Pipe::Compose(Box::new(self), Box::new(right))
    }

    pub fn iterate(self) -> Pipe {
        Pipe::Iterate(Box::new(self))
    }
}

/// A compiled query: the output profile, the data pipe, and the SQL of
/// the leading segment for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub meta: Profile,
    pub data: Pipe,
    pub sql: String,
}

/// The executed output: data matching the plan profile.
#[derive(Debug, Clone, Serialize)]
pub struct Product {
    pub meta: Profile,
    pub data: Data,
}

/// The connection surface the executor runs against.  Execution itself
/// is out of the compiler's hands; the host supplies the rows.
pub trait Database {
    fn execute(&mut self, sql: &str, input: Option<&[Data]>) -> Result<Vec<Vec<Value>>>;

    fn can_read(&self) -> bool {
        true
    }

    fn can_write(&self) -> bool {
        false
    }

    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A scoped transaction: commits on normal exit, rolls back when
/// dropped before [Transaction::commit].
pub struct Transaction<'a> {
    database: Option<&'a mut dyn Database>,
}

impl<'a> Transaction<'a> {
    pub fn begin(database: &'a mut dyn Database) -> Result<Transaction<'a>> {
        database.begin()?;
        Ok(Transaction {
            database: Some(database),
        })
    }

    pub fn database(&mut self) -> &mut dyn Database {
        *self.database.as_mut().expect("an open transaction")
    }

    pub fn commit(mut self) -> Result<()> {
        let database = self.database.take().expect("an open transaction");
        database.commit()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let Some(database) = self.database.take() {
            let _ = database.rollback();
        }
    }
}

/// Executes a plan and wraps the result into a [Product].
pub fn produce(plan: &Plan, database: &mut dyn Database) -> Result<Product> {
    let mut transaction = Transaction::begin(database)?;
    let data = execute(&plan.data, Data::Null, transaction.database())?;
    transaction.commit()?;
    Ok(Product {
        meta: plan.meta.clone(),
        data,
    })
}

/// Interprets a pipe over the given input.
pub fn execute(pipe: &Pipe, input: Data, database: &mut dyn Database) -> Result<Data> {
    match pipe {
        Pipe::Value(data) => Ok(data.clone()),
        Pipe::Extract(index) => {
            let Data::Record(fields) = &input else {
                return Err(Error::simple("expected a record input").into());
            };
            let position = if *index < 0 {
                fields.len() as isize + index
            } else {
                *index
            };
            fields
                .get(position as usize)
                .cloned()
                .ok_or_else(|| Error::simple("record index out of range").into())
        }
        Pipe::Record(field_pipes) => {
            let fields = field_pipes
                .iter()
                .map(|field_pipe| execute(field_pipe, input.clone(), database))
                .collect::<Result<Vec<_>>>()?;
            Ok(Data::record(fields))
        }
        Pipe::Iterate(value_pipe) => {
            let Data::List(items) = &input else {
                return Err(Error::simple("expected a list input").into());
            };
            let items = items
                .iter()
                .map(|item| execute(value_pipe, item.clone(), database))
                .collect::<Result<Vec<_>>>()?;
            Ok(Data::list(items))
        }
        Pipe::Compose(left, right) => {
            let output = execute(left, input, database)?;
            execute(right, output, database)
        }
        Pipe::Annihilate { test, value } => {
            if matches!(&**test, Pipe::Value(Data::Value(Value::Boolean(true)))) {
                return execute(value, input, database);
            }
            let indicator = execute(test, input.clone(), database)?;
            if indicator == Data::Value(Value::Boolean(true)) {
                execute(value, input, database)
            } else {
                Ok(Data::Null)
            }
        }
        Pipe::Single => {
            let Data::List(items) = &input else {
                return Err(Error::simple("expected a list input").into());
            };
            if items.len() > 1 {
                return Err(Error::simple("expected no more than one row").into());
            }
            Ok(items.first().cloned().unwrap_or(Data::Null))
        }
        Pipe::Mix { keys } => mix(keys, input, database),
        Pipe::Sql { sql, input: input_domains, .. }
        | Pipe::BatchSql { sql, input: input_domains, .. } => {
            if !database.can_read() {
                return Err(Error::simple("no read permissions").into());
            }
            let parameters = match input_domains {
                None => None,
                Some(_) => match &input {
                    Data::Record(fields) => Some(fields.as_ref().clone()),
                    Data::Null => Some(Vec::new()),
                    other => Some(vec![other.clone()]),
                },
            };
            let rows = database.execute(sql, parameters.as_deref())?;
            Ok(Data::list(
                rows.into_iter()
                    .map(|row| Data::record(row.into_iter().map(Data::Value).collect()))
                    .collect(),
            ))
        }
    }
}

/// Merge-joins the parent rows with each child result.  Assumes both
/// sides are sorted lexicographically on the joint keys; the weak
/// ordering added by stitch guarantees it.
fn mix(keys: &[Pipe], input: Data, database: &mut dyn Database) -> Result<Data> {
    let Data::Record(sides) = &input else {
        return Err(Error::simple("expected mixed inputs").into());
    };
    let parent_key_pipe = &keys[0];
    let kid_key_pipes = &keys[1..];
    let parent = sides
        .first()
        .and_then(|side| side.as_list())
        .ok_or_else(|| -> anyhow::Error { Error::simple("expected parent rows").into() })?;
    let kids: Vec<&Vec<Data>> = sides[1..]
        .iter()
        .map(|side| {
            side.as_list()
                .ok_or_else(|| -> anyhow::Error { Error::simple("expected child rows").into() })
        })
        .collect::<Result<_>>()?;
    let mut tops = vec![0usize; kids.len()];
    let mut output = Vec::new();
    for parent_row in parent {
        let Data::Record(fields) = parent_row else {
            return Err(Error::simple("expected a record row").into());
        };
        let mut row = fields.as_ref().clone();
        let parent_key = execute(parent_key_pipe, parent_row.clone(), database)?;
        for (idx, kid) in kids.iter().enumerate() {
            let mut kid_rows = Vec::new();
            while tops[idx] < kid.len() {
                let kid_row = &kid[tops[idx]];
                let kid_key = execute(&kid_key_pipes[idx], kid_row.clone(), database)?;
                if kid_key != parent_key {
                    break;
                }
                kid_rows.push(kid_row.clone());
                tops[idx] += 1;
            }
            row.push(Data::list(kid_rows));
        }
        output.push(Data::record(row));
    }
    debug_assert!(tops
        .iter()
        .zip(kids.iter())
        .all(|(top, kid)| *top == kid.len()));
    Ok(Data::list(output))
}

impl Data {
    fn as_list(&self) -> Option<&Vec<Data>> {
        match self {
            Data::List(items) => Some(items),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct NoDatabase;

    impl Database for NoDatabase {
        fn execute(&mut self, _sql: &str, _input: Option<&[Data]>) -> Result<Vec<Vec<Value>>> {
            unreachable!("no SQL in these tests")
        }
    }

    fn value(v: i64) -> Data {
        Data::Value(Value::Integer(v))
    }

    #[test]
    fn extract_handles_negative_indexes() {
        let row = Data::record(vec![value(1), value(2), value(3)]);
        let mut db = NoDatabase;
        assert_eq!(execute(&Pipe::Extract(0), row.clone(), &mut db).unwrap(), value(1));
        assert_eq!(execute(&Pipe::Extract(-1), row, &mut db).unwrap(), value(3));
    }

    #[test]
    fn annihilate_collapses_false_records() {
        let mut db = NoDatabase;
        let pipe = Pipe::Annihilate {
            test: Box::new(Pipe::Extract(0)),
            value: Box::new(Pipe::Extract(1)),
        };
        let present = Data::record(vec![Data::Value(Value::Boolean(true)), value(7)]);
        let absent = Data::record(vec![Data::Value(Value::Boolean(false)), value(7)]);
        assert_eq!(execute(&pipe, present, &mut db).unwrap(), value(7));
        assert_eq!(execute(&pipe, absent, &mut db).unwrap(), Data::Null);
    }

    #[test]
    fn single_rejects_plural_input() {
        let mut db = NoDatabase;
        assert_eq!(
            execute(&Pipe::Single, Data::list(vec![value(1)]), &mut db).unwrap(),
            value(1)
        );
        assert_eq!(
            execute(&Pipe::Single, Data::list(vec![]), &mut db).unwrap(),
            Data::Null
        );
        assert!(execute(&Pipe::Single, Data::list(vec![value(1), value(2)]), &mut db).is_err());
    }

    #[test]
    fn mix_merges_sorted_children() {
        let mut db = NoDatabase;
        // Parent rows keyed by the first field; children keyed by their
        // first field too.
        let parent = Data::list(vec![
            Data::record(vec![value(1), Data::Value(Value::Text("a".into()))]),
            Data::record(vec![value(2), Data::Value(Value::Text("b".into()))]),
        ]);
        let kid = Data::list(vec![
            Data::record(vec![value(1), value(10)]),
            Data::record(vec![value(1), value(11)]),
            Data::record(vec![value(2), value(20)]),
        ]);
        let pipe = Pipe::Mix {
            keys: vec![Pipe::Extract(0), Pipe::Extract(0)],
        };
        let mixed = execute(&pipe, Data::record(vec![parent, kid]), &mut db).unwrap();
        let Data::List(rows) = mixed else { panic!() };
        assert_eq!(rows.len(), 2);
        let Data::Record(first) = &rows[0] else { panic!() };
        // Row fields plus the appended child list.
        assert_eq!(first.len(), 3);
        let Data::List(first_kids) = &first[2] else { panic!() };
        assert_eq!(first_kids.len(), 2);
    }

    #[test]
    fn transaction_rolls_back_on_drop() {
        struct Tracker {
            committed: bool,
            rolled_back: bool,
        }
        impl Database for Tracker {
            fn execute(&mut self, _: &str, _: Option<&[Data]>) -> Result<Vec<Vec<Value>>> {
                Ok(Vec::new())
            }
            fn commit(&mut self) -> Result<()> {
                self.committed = true;
                Ok(())
            }
            fn rollback(&mut self) -> Result<()> {
                self.rolled_back = true;
                Ok(())
            }
        }
        let mut db = Tracker {
            committed: false,
            rolled_back: false,
        };
        {
            let _transaction = Transaction::begin(&mut db).unwrap();
            // dropped without a commit
        }
        assert!(db.rolled_back && !db.committed);
        let transaction = Transaction::begin(&mut db).unwrap();
        transaction.commit().unwrap();
        assert!(db.committed);
    }

    #[test]
    fn permission_is_checked_on_entry() {
        struct ReadOnly;
        impl Database for ReadOnly {
            fn execute(&mut self, _: &str, _: Option<&[Data]>) -> Result<Vec<Vec<Value>>> {
                Ok(Vec::new())
            }
            fn can_read(&self) -> bool {
                false
            }
        }
        let mut db = ReadOnly;
        let pipe = Pipe::Sql {
            sql: "SELECT 1".into(),
            input: None,
            output: vec![Domain::Integer],
        };
        let error = execute(&pipe, Data::Null, &mut db).unwrap_err();
        assert!(error.to_string().contains("no read permissions"));
    }
}
