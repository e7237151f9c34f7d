//! Pass infrastructure (§4.6, §4.9): the `Pass` trait, its declared
//! read/write set, and the manager that runs a pipeline with optional
//! debug-mode re-verification between passes.
//!
//! A driver that runs a fixed list of named transformations and reports
//! what changed generalizes here from a single hardcoded pipeline into a
//! trait object dispatch with declared analysis dependencies, since
//! `proclower` and `deseq` mutate the *unit kind* itself, not just
//! instructions in place.

use log::{debug, warn};

use crate::error::PassError;
use crate::module::Module;
use crate::verify::verify_module;

/// What a pass declares about its relationship to analyses and the module
/// table (§4.6: "a declared read/write set").
#[derive(Debug, Clone, Copy, Default)]
pub struct PassSignature {
    pub uses_dominance: bool,
    pub invalidates_dominance: bool,
    pub reads_module_table: bool,
    pub writes_module_table: bool,
}

/// The result of running one pass over one unit or the whole module
/// (§7 rule 3).
#[derive(Debug, Clone)]
pub enum PassOutcome {
    Applied { changed: bool },
    Declined(String),
    Internal(PassError),
}

impl PassOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, PassOutcome::Internal(_))
    }

    pub fn changed(&self) -> bool {
        matches!(self, PassOutcome::Applied { changed: true })
    }
}

/// A named transformation over a module (§4.6). Implementations mutate
/// `module` in place and report what happened via [`PassOutcome`].
pub trait Pass {
    fn name(&self) -> &'static str;

    fn signature(&self) -> PassSignature {
        PassSignature::default()
    }

    fn run(&self, module: &mut Module) -> PassOutcome;
}

/// Runs a pipeline of passes over a module, re-verifying between each pass
/// when `debug_reverify` is set (§4.6: "re-verifies between passes in
/// debug mode" — a plain struct field driven by the optimization level
/// rather than a config file, per §2's ambient-stack note).
pub struct PassManager {
    pub debug_reverify: bool,
}

impl Default for PassManager {
    fn default() -> Self {
        PassManager { debug_reverify: cfg!(debug_assertions) }
    }
}

impl PassManager {
    pub fn new(debug_reverify: bool) -> Self {
        PassManager { debug_reverify }
    }

    /// Run `passes` in order over `module`. Stops and returns early on the
    /// first `Internal` outcome (§4.9: "an internal pass error... the pass
    /// must leave the IR in a valid state or abort the whole run").
    pub fn run(&self, module: &mut Module, passes: &[&dyn Pass]) -> Vec<PassOutcome> {
        let mut outcomes = Vec::with_capacity(passes.len());
        for pass in passes {
            debug!("running pass `{}`", pass.name());
            let outcome = pass.run(module);
            let failed = outcome.is_failure();
            if let PassOutcome::Declined(reason) = &outcome {
                debug!("pass `{}` declined: {}", pass.name(), reason);
            }
            outcomes.push(outcome);
            if failed {
                warn!("pass `{}` reported an internal error; aborting pipeline", pass.name());
                break;
            }
            if self.debug_reverify {
                let diagnostics = verify_module(module);
                if !diagnostics.is_empty() {
                    let rendered = diagnostics.iter().map(|d| d.to_string()).collect::<Vec<_>>().join("\n");
                    warn!("pass `{}` left the module unverifiable:\n{}", pass.name(), rendered);
                    outcomes.push(PassOutcome::Internal(PassError::ProducedInvalidIr {
                        pass: pass.name().to_string(),
                        diagnostics: rendered,
                    }));
                    break;
                }
            }
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoOpPass;
    impl Pass for NoOpPass {
        fn name(&self) -> &'static str {
            "noop"
        }
        fn run(&self, _module: &mut Module) -> PassOutcome {
            PassOutcome::Applied { changed: false }
        }
    }

    #[test]
    fn manager_runs_passes_in_order_and_reverifies() {
        // Lets `RUST_LOG=debug cargo test` surface this manager's `debug!`/
        // `warn!` trace; harmless (and ignored) if another test already
        // initialized the global logger first.
        let _ = env_logger::try_init();
        let mut module = Module::new();
        let manager = PassManager::new(true);
        let outcomes = manager.run(&mut module, &[&NoOpPass]);
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].is_failure());
    }
}
