use crate::error::{Error, Result};

const MAX_IDENTIFIER_LEN: usize = 63;

/// Check that `name` is a plain SQL identifier. Table names from config are
/// interpolated into statements, so nothing that needs quoting is accepted.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Config(format!(
            "invalid table name '{name}': use letters, digits and underscores"
        )));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::Config(format!("table name '{name}' too long")));
    }
    Ok(())
}
