//! `__COMPAT_LAYER=RunAsInvoker` guard.
//!
//! Exporting the compat layer before `CreateProcessW` makes the loader
//! ignore `requestedExecutionLevel` in the target's embedded manifest, so
//! targets that demand elevation still launch under the invoker's token. The
//! launcher's own environment is restored on drop; the child keeps the copy
//! it inherited.

use std::env;

use shared::errors::LaunchError;

const COMPAT_LAYER: &str = "__COMPAT_LAYER";
const RUN_AS_INVOKER: &str = "RunAsInvoker";

pub struct CompatLayerGuard {
    original: Option<String>,
    active: bool,
}

fn contains_run_as_invoker(value: &str) -> bool {
    value
        .split(' ')
        .any(|token| token.eq_ignore_ascii_case(RUN_AS_INVOKER))
}

/// `env::set_var` panics on NUL; reject the value first so a hostile
/// inherited `__COMPAT_LAYER` surfaces as a launch failure instead.
fn set_compat_var(value: &str) -> Result<(), LaunchError> {
    if value.contains('\0') {
        return Err(LaunchError::CompatLayer {
            detail: "inherited __COMPAT_LAYER value contains a NUL character".to_string(),
        });
    }
    unsafe { env::set_var(COMPAT_LAYER, value) };
    Ok(())
}

impl CompatLayerGuard {
    pub fn enable_run_as_invoker() -> Result<Self, LaunchError> {
        let original = env::var(COMPAT_LAYER).ok();
        match &original {
            Some(existing) if contains_run_as_invoker(existing) => Ok(Self {
                original,
                active: false,
            }),
            Some(existing) => {
                let merged = format!("{existing} {RUN_AS_INVOKER}");
                set_compat_var(&merged)?;
                Ok(Self {
                    original,
                    active: true,
                })
            }
            None => {
                set_compat_var(RUN_AS_INVOKER)?;
                Ok(Self {
                    original,
                    active: true,
                })
            }
        }
    }
}

impl Drop for CompatLayerGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        match &self.original {
            Some(value) => unsafe { env::set_var(COMPAT_LAYER, value) },
            None => unsafe { env::remove_var(COMPAT_LAYER) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_matching_is_word_based() {
        assert!(contains_run_as_invoker("RunAsInvoker"));
        assert!(contains_run_as_invoker("HIGHDPIAWARE runasinvoker"));
        assert!(!contains_run_as_invoker("RunAsInvokerX"));
        assert!(!contains_run_as_invoker(""));
    }

    #[test]
    fn nul_in_compat_value_is_a_launch_error() {
        let err = set_compat_var("bad\0value").unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}
