//! Worker-facing types shared between the orchestrator and the tools that
//! generate worker configuration.
//!
//! - [`Role`] and [`ControlToken`]: the fixed topology and its control plane.
//! - [`ConfigDocument`]: a validated nested YAML document for one worker.
//! - [`ConfigTemplate`]: `${name}` templates rendered into documents.

#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod document;
mod role;
mod template;

pub use document::*;
pub use role::*;
pub use template::*;

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_role_file_names() {
        assert_eq!(Role::Coordinator.config_file_name(), "config_agg.yml");
        assert_eq!(Role::Participant(3).config_file_name(), "config_party3.yml");
        assert_eq!(Role::Participant(3).stdout_file_name(), "stdout_party3.txt");
        assert_eq!(Role::Coordinator.stderr_file_name(), "stderr_agg.txt");
    }

    #[test]
    fn test_default_commands_are_valid() {
        for role in [Role::Coordinator, Role::Participant(0)] {
            ControlToken::validate_sequence(&role.default_commands(), role).unwrap();
        }
    }

    #[test]
    fn test_enum_serde() {
        assert_eq!(
            serde_json::from_str::<ControlToken>("\"REGISTER\"").unwrap(),
            ControlToken::Register
        );
        assert_eq!(" train ".parse::<ControlToken>().unwrap(), ControlToken::Train);
    }

    #[test_case(ControlToken::Start, Role::Participant(0), true ; "start on participant")]
    #[test_case(ControlToken::Register, Role::Participant(1), true ; "register on participant")]
    #[test_case(ControlToken::Register, Role::Coordinator, false ; "register on coordinator")]
    #[test_case(ControlToken::Sync, Role::Coordinator, true ; "sync on coordinator")]
    #[test_case(ControlToken::Train, Role::Participant(0), false ; "train on participant")]
    fn test_token_roles(token: ControlToken, role: Role, allowed: bool) {
        assert_eq!(token.allowed_for(role), allowed);
        assert_eq!(
            ControlToken::validate_sequence(&[ControlToken::Start, token], role).is_ok(),
            allowed
        );
    }
}
