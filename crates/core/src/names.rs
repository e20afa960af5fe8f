//! DNS-1123 label validation for namespace and item names.

use std::sync::OnceLock;

use regex::Regex;

use crate::{StoreError, StoreResult};

pub const MAX_NAME_LEN: usize = 63;

fn label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"))
}

pub fn validate_name(name: &str) -> StoreResult<()> {
    if name.is_empty() {
        return Err(StoreError::Invalid("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(StoreError::Invalid(format!("{}: must be no more than {} characters", name, MAX_NAME_LEN)));
    }
    if !label_re().is_match(name) {
        return Err(StoreError::Invalid(format!(
            "{}: must consist of lower case alphanumeric characters or '-', and start and end with an alphanumeric",
            name
        )));
    }
    Ok(())
}
