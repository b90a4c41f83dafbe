//! The catalog model: schemas, tables, columns, keys and joins.
//!
//! The catalog is produced by introspection upstream and is immutable for
//! the whole lifetime of a compilation.  Tables and columns are referred
//! to by index into the catalog arena; the references are tiny `Copy`
//! values that appear throughout the IRs.

use serde::Serialize;

use crate::domain::Domain;

#[derive(Debug, Default)]
pub struct Catalog {
    tables: Vec<Table>,
}

#[derive(Debug)]
pub struct Table {
    pub schema: Option<String>,
    pub name: String,
    pub columns: Vec<Column>,
    pub unique_keys: Vec<UniqueKey>,
    pub foreign_keys: Vec<ForeignKey>,
}

#[derive(Debug)]
pub struct Column {
    pub name: String,
    pub domain: Domain,
    pub is_nullable: bool,
}

#[derive(Debug)]
pub struct UniqueKey {
    pub columns: Vec<usize>,
    pub is_primary: bool,
    /// A partial key holds only over a subset of the rows and cannot be
    /// used for connecting terms.
    pub is_partial: bool,
}

#[derive(Debug)]
pub struct ForeignKey {
    pub origin_columns: Vec<usize>,
    pub target: TableRef,
    pub target_columns: Vec<usize>,
}

/// An index into the catalog table arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TableRef(pub(crate) usize);

impl std::fmt::Debug for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "table-{}", self.0)
    }
}

/// A column of a specific table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ColumnRef {
    pub table: TableRef,
    pub index: usize,
}

impl std::fmt::Debug for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "column-{}.{}", self.table.0, self.index)
    }
}

impl Catalog {
    pub fn new() -> Catalog {
        Catalog::default()
    }

    pub fn add_table<S: Into<String>>(&mut self, name: S) -> TableRef {
        self.tables.push(Table {
            schema: None,
            name: name.into(),
            columns: Vec::new(),
            unique_keys: Vec::new(),
            foreign_keys: Vec::new(),
        });
        TableRef(self.tables.len() - 1)
    }

    pub fn add_column<S: Into<String>>(
        &mut self,
        table: TableRef,
        name: S,
        domain: Domain,
        is_nullable: bool,
    ) -> ColumnRef {
        let columns = &mut self.tables[table.0].columns;
        columns.push(Column {
            name: name.into(),
            domain,
            is_nullable,
        });
        ColumnRef {
            table,
            index: columns.len() - 1,
        }
    }

    pub fn add_primary_key(&mut self, table: TableRef, columns: &[&str]) {
        let columns = self.column_indexes(table, columns);
        self.tables[table.0].unique_keys.push(UniqueKey {
            columns,
            is_primary: true,
            is_partial: false,
        });
    }

    pub fn add_unique_key(&mut self, table: TableRef, columns: &[&str]) {
        let columns = self.column_indexes(table, columns);
        self.tables[table.0].unique_keys.push(UniqueKey {
            columns,
            is_primary: false,
            is_partial: false,
        });
    }

    pub fn add_foreign_key(
        &mut self,
        origin: TableRef,
        origin_columns: &[&str],
        target: TableRef,
        target_columns: &[&str],
    ) {
        assert_eq!(origin_columns.len(), target_columns.len());
        let origin_columns = self.column_indexes(origin, origin_columns);
        let target_columns = self.column_indexes(target, target_columns);
        self.tables[origin.0].foreign_keys.push(ForeignKey {
            origin_columns,
            target,
            target_columns,
        });
    }

    fn column_indexes(&self, table: TableRef, names: &[&str]) -> Vec<usize> {
        names
            .iter()
            .map(|name| {
                self.tables[table.0]
                    .columns
                    .iter()
                    .position(|column| column.name == *name)
                    .unwrap_or_else(|| panic!("no column {name} in {}", self.tables[table.0].name))
            })
            .collect()
    }

    pub fn table(&self, table: TableRef) -> &Table {
        &self.tables[table.0]
    }

    pub fn column(&self, column: ColumnRef) -> &Column {
        &self.tables[column.table.0].columns[column.index]
    }

    pub fn tables(&self) -> impl Iterator<Item = (TableRef, &Table)> {
        self.tables
            .iter()
            .enumerate()
            .map(|(index, table)| (TableRef(index), table))
    }

    pub fn table_by_name(&self, name: &str) -> Option<TableRef> {
        self.tables
            .iter()
            .position(|table| table.name == name)
            .map(TableRef)
    }

    pub fn column_by_name(&self, table: TableRef, name: &str) -> Option<ColumnRef> {
        self.tables[table.0]
            .columns
            .iter()
            .position(|column| column.name == name)
            .map(|index| ColumnRef { table, index })
    }

    /// The primary key of the table, if one was introspected.
    pub fn primary_key(&self, table: TableRef) -> Option<&UniqueKey> {
        self.tables[table.0]
            .unique_keys
            .iter()
            .find(|key| key.is_primary)
    }

    /// The columns that uniquely identify a row: the primary key, or the
    /// first total unique key over non-nullable columns.
    pub fn connecting_columns(&self, table: TableRef) -> Option<Vec<ColumnRef>> {
        let entity = &self.tables[table.0];
        let key = entity.unique_keys.iter().find(|key| key.is_primary).or_else(|| {
            entity.unique_keys.iter().find(|key| {
                !key.is_partial
                    && key
                        .columns
                        .iter()
                        .all(|index| !entity.columns[*index].is_nullable)
            })
        })?;
        Some(
            key.columns
                .iter()
                .map(|index| ColumnRef {
                    table,
                    index: *index,
                })
                .collect(),
        )
    }

    /// Direct joins from the table along its foreign keys.
    pub fn direct_joins(&self, table: TableRef) -> Vec<Join> {
        self.tables[table.0]
            .foreign_keys
            .iter()
            .map(|fk| self.direct_join(table, fk))
            .collect()
    }

    /// Reverse joins into the table from foreign keys of other tables.
    pub fn reverse_joins(&self, table: TableRef) -> Vec<Join> {
        let mut joins = Vec::new();
        for (origin, entity) in self.tables() {
            for fk in &entity.foreign_keys {
                if fk.target == table {
                    joins.push(self.direct_join(origin, fk).reversed());
                }
            }
        }
        joins
    }

    fn direct_join(&self, origin: TableRef, fk: &ForeignKey) -> Join {
        let entity = &self.tables[origin.0];
        // A foreign key points at a unique key, so a direct join never
        // produces more than one row; it produces exactly one when none
        // of the referring columns is nullable.
        let is_expanding = fk
            .origin_columns
            .iter()
            .all(|index| !entity.columns[*index].is_nullable);
        Join {
            origin,
            target: fk.target,
            origin_columns: fk
                .origin_columns
                .iter()
                .map(|index| ColumnRef {
                    table: origin,
                    index: *index,
                })
                .collect(),
            target_columns: fk
                .target_columns
                .iter()
                .map(|index| ColumnRef {
                    table: fk.target,
                    index: *index,
                })
                .collect(),
            is_direct: true,
            is_contracting: true,
            is_expanding,
        }
    }
}

/// A connection between two tables, derived from a foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Join {
    pub origin: TableRef,
    pub target: TableRef,
    pub origin_columns: Vec<ColumnRef>,
    pub target_columns: Vec<ColumnRef>,
    pub is_direct: bool,
    pub is_contracting: bool,
    pub is_expanding: bool,
}

impl Join {
    pub fn reversed(&self) -> Join {
        Join {
            origin: self.target,
            target: self.origin,
            origin_columns: self.target_columns.clone(),
            target_columns: self.origin_columns.clone(),
            is_direct: !self.is_direct,
            // The reverse of a foreign-key join is one-to-many: it never
            // guarantees a row and contracts only when the referring
            // columns are themselves unique.
            is_contracting: false,
            is_expanding: false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> (Catalog, TableRef, TableRef) {
        let mut catalog = Catalog::new();
        let school = catalog.add_table("school");
        catalog.add_column(school, "code", Domain::text(), false);
        catalog.add_column(school, "name", Domain::text(), false);
        catalog.add_primary_key(school, &["code"]);
        let department = catalog.add_table("department");
        catalog.add_column(department, "code", Domain::text(), false);
        catalog.add_column(department, "school_code", Domain::text(), true);
        catalog.add_primary_key(department, &["code"]);
        catalog.add_foreign_key(department, &["school_code"], school, &["code"]);
        (catalog, school, department)
    }

    #[test]
    fn direct_join_follows_the_foreign_key() {
        let (catalog, school, department) = sample();
        let joins = catalog.direct_joins(department);
        assert_eq!(joins.len(), 1);
        let join = &joins[0];
        assert_eq!(join.target, school);
        assert!(join.is_direct && join.is_contracting);
        // `school_code` is nullable, so the join does not expand.
        assert!(!join.is_expanding);
    }

    #[test]
    fn reverse_join_flips_the_columns() {
        let (catalog, school, department) = sample();
        let joins = catalog.reverse_joins(school);
        assert_eq!(joins.len(), 1);
        let join = &joins[0];
        assert_eq!(join.origin, school);
        assert_eq!(join.target, department);
        assert!(!join.is_direct && !join.is_contracting && !join.is_expanding);
    }

    #[test]
    fn connecting_columns_prefer_the_primary_key() {
        let (catalog, school, _) = sample();
        let columns = catalog.connecting_columns(school).unwrap();
        assert_eq!(columns.len(), 1);
        assert_eq!(catalog.column(columns[0]).name, "code");
    }
}
