/*!
The three per-frame programs. Each one is "compiled" from [`SimulationParams`]
once: constants are validated and the kernel coefficients are precomputed, so a
bad configuration fails before the first frame instead of producing NaNs.
*/

mod density_pressure;
mod force;
mod integration;

pub use density_pressure::{DensityPressureOutput, DensityPressureProgram};
pub use force::{pairwise_pressure_force, ForceOutput, ForceProgram};
pub use integration::{IntegrationOutput, IntegrationProgram};

use crate::floating_type_mod::FT;

/// Collects every problem found while compiling a program, so the diagnostic
/// lists all of them at once.
#[derive(Default)]
struct CompileLog {
    messages: Vec<String>,
}

impl CompileLog {
    fn require(&mut self, ok: bool, message: impl FnOnce() -> String) {
        if !ok {
            self.messages.push(message());
        }
    }

    fn positive(&mut self, name: &str, value: FT) {
        self.require(value.is_finite() && value > 0., || {
            format!("{}={} must be positive and finite", name, value)
        });
    }

    fn non_negative(&mut self, name: &str, value: FT) {
        self.require(value.is_finite() && value >= 0., || {
            format!("{}={} must be non-negative and finite", name, value)
        });
    }

    fn finish(self, kernel: &'static str) -> Result<(), crate::SimulationError> {
        if self.messages.is_empty() {
            return Ok(());
        }
        let diagnostic = self.messages.join("\n");
        log::error!("kernel `{}` rejected:\n{}", kernel, diagnostic);
        Err(crate::SimulationError::KernelCompile { kernel, diagnostic })
    }
}

#[test]
fn compile_log_lists_every_problem() {
    let mut log = CompileLog::default();
    log.positive("h", 0.);
    log.non_negative("viscosity", -1.);
    log.positive("mass", 0.02);

    match log.finish("test") {
        Err(crate::SimulationError::KernelCompile { kernel, diagnostic }) => {
            assert_eq!(kernel, "test");
            assert_eq!(diagnostic.lines().count(), 2);
            assert!(diagnostic.contains("h=0"));
            assert!(diagnostic.contains("viscosity=-1"));
        }
        other => panic!("unexpected result {:?}", other),
    }
}
