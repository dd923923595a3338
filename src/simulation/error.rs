use std::fmt;

/// Fatal failures of the simulation. None of them is retried: the driver
/// aborts the run and reports the diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulationError {
    /// The compute context, the particle buffer, the configuration or the host
    /// window could not be set up.
    Initialization(String),
    /// A stage program could not be built from its constants.
    KernelCompile { kernel: &'static str, diagnostic: String },
    /// The three stage programs cannot be combined into one pipeline.
    KernelLink { diagnostic: String },
    /// The backend rejected a stage dispatch.
    Dispatch { stage: &'static str, reason: String },
    /// The host failed to draw a frame or write a snapshot.
    Present(String),
}

impl fmt::Display for SimulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulationError::Initialization(msg) => write!(f, "initialization failed: {}", msg),
            SimulationError::KernelCompile { kernel, diagnostic } => {
                write!(f, "compiling kernel `{}` failed:\n{}", kernel, diagnostic)
            }
            SimulationError::KernelLink { diagnostic } => write!(f, "linking pipeline failed:\n{}", diagnostic),
            SimulationError::Dispatch { stage, reason } => {
                write!(f, "dispatch of stage `{}` failed: {}", stage, reason)
            }
            SimulationError::Present(msg) => write!(f, "presenting frame failed: {}", msg),
        }
    }
}

impl std::error::Error for SimulationError {}

impl SimulationError {
    pub fn is_fatal_before_first_frame(&self) -> bool {
        matches!(
            self,
            SimulationError::Initialization(_) | SimulationError::KernelCompile { .. } | SimulationError::KernelLink { .. }
        )
    }
}

#[test]
fn error_messages_carry_diagnostic_text() {
    let e = SimulationError::KernelCompile {
        kernel: "density-pressure",
        diagnostic: String::from("smoothing radius h=0 must be positive"),
    };
    let s = e.to_string();
    assert!(s.contains("density-pressure"));
    assert!(s.contains("h=0"));
    assert!(e.is_fatal_before_first_frame());

    let e = SimulationError::Dispatch {
        stage: "force",
        reason: String::from("worker panicked"),
    };
    assert!(!e.is_fatal_before_first_frame());
}
