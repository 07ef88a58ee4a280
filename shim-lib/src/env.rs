//! Environment lookups with primary/legacy name fallback. The launcher sets
//! both spellings; standalone targets may only carry the legacy one.

use std::env;

pub fn var_compat(primary: &str, legacy: &str) -> Option<String> {
    read(primary).or_else(|| read(legacy))
}

fn read(name: &str) -> Option<String> {
    let value = env::var_os(name)?;
    let value = value.to_string_lossy().into_owned();
    if value.is_empty() { None } else { Some(value) }
}
