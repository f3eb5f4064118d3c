use std::{error::Error, str::FromStr};

use snafu::{ResultExt, Whatever};

/// Every variable the service reads is namespaced by this prefix.
pub const ENV_PREFIX: &str = "STITCH_";

/// Reads `STITCH_<key>` for the current process.
///
/// Compared to [std::env::var] there are a couple of differences:
///
/// - [var] uses [dotenvy] which loads the `.env` file from the current or
///   parent directories before returning the value.
///
/// - [var] returns `Ok(None)` (instead of `Err`) if the variable wasn't set
///   or is set to an empty string.
#[track_caller]
pub fn var(key: &str) -> Result<Option<String>, Whatever> {
    let name = format!("{ENV_PREFIX}{key}");
    match dotenvy::var(&name) {
        Ok(content) if content.trim().is_empty() => Ok(None),
        Ok(content) => Ok(Some(content)),
        Err(dotenvy::Error::EnvVar(std::env::VarError::NotPresent)) => Ok(None),
        Err(error) => Err(error).with_whatever_context(|_| {
            format!("Failed to read {name} environment variable")
        }),
    }
}

/// Reads `STITCH_<key>` and parses it if it is set.
#[track_caller]
pub fn var_parsed<R>(key: &str) -> Result<Option<R>, Whatever>
where
    R: FromStr,
    R::Err: Error + Send + Sync + 'static,
{
    match var(key)? {
        Some(content) => Ok(Some(content.trim().parse().with_whatever_context(|e| {
            format!("Failed to parse {ENV_PREFIX}{key} environment variable; {e}")
        })?)),
        None => Ok(None),
    }
}
