/// Process exit codes the agent reports in non-interactive mode.
///
/// The CLI shell around the core maps these onto `std::process::exit`; the
/// values are a stable contract for scripts driving the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    AuthRequired = 2,
    AuthFlowFailed = 3,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable() {
        assert_eq!(i32::from(ExitCode::Success), 0);
        assert_eq!(i32::from(ExitCode::GeneralError), 1);
        assert_eq!(i32::from(ExitCode::AuthRequired), 2);
        assert_eq!(i32::from(ExitCode::AuthFlowFailed), 3);
    }
}
