//! The passes the core ships (§4.6's named pipeline entries: `proclower`,
//! `deseq`, `dce`, `cf`, `verify`).

pub mod constfold;
pub mod dce;
pub mod deseq;
pub mod proclower;

use crate::module::Module;
use crate::pass::{Pass, PassOutcome, PassSignature};
use crate::verify::verify_module;

/// Wraps the verifier (component F) as a read-only pass (§4.6's library
/// contract names `verify` alongside the mutating passes).
pub struct VerifyPass;

impl Pass for VerifyPass {
    fn name(&self) -> &'static str {
        "verify"
    }

    fn signature(&self) -> PassSignature {
        PassSignature { uses_dominance: true, ..Default::default() }
    }

    fn run(&self, module: &mut Module) -> PassOutcome {
        let diagnostics = verify_module(module);
        if diagnostics.is_empty() {
            PassOutcome::Applied { changed: false }
        } else {
            let rendered = diagnostics.iter().map(|d| d.to_string()).collect::<Vec<_>>().join("\n");
            PassOutcome::Declined(rendered)
        }
    }
}
