/// Unique index for a symmetric self-referential relation.
///
/// A row linking A to B is the same relation as one linking B to A, so the
/// index is built over `(min(left, right), max(left, right))` rather than
/// the raw columns. Rows where both ends are equal are left out of the index
/// and may repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymmetricPairIndex {
    pub name: &'static str,
    pub table: &'static str,
    pub left: &'static str,
    pub right: &'static str,
}

impl SymmetricPairIndex {
    pub fn create_sql(&self) -> String {
        let Self {
            name,
            table,
            left,
            right,
        } = self;
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {name}
                ON {table} (min({left}, {right}), max({left}, {right}))
                WHERE {left} != {right};"
        )
    }

    pub fn drop_sql(&self) -> String {
        format!("DROP INDEX IF EXISTS {};", self.name)
    }
}
