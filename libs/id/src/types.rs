//! Identifier definitions for cluster resources.

use crate::{define_id, define_name};

// =============================================================================
// Workload and Membership
// =============================================================================

define_name!(UnitName, "unit name");
define_name!(MachineId, "machine id");

// =============================================================================
// Control Plane Roles
// =============================================================================

define_id!(EngineId, "eng");

impl UnitName {
    /// Returns the unit type suffix (`service` for `web.service`), if any.
    #[must_use]
    pub fn unit_type(&self) -> Option<&str> {
        self.as_str().rsplit_once('.').map(|(_, suffix)| suffix)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn test_unit_name_parse() {
        let name: UnitName = "web.service".parse().unwrap();
        assert_eq!(name.as_str(), "web.service");
        assert_eq!(name.unit_type(), Some("service"));
    }

    #[test]
    fn test_unit_name_empty() {
        let result: Result<UnitName, _> = "".parse();
        assert!(matches!(result.unwrap_err(), IdError::Empty));
    }

    #[test]
    fn test_unit_name_rejects_slash() {
        let err = UnitName::parse("a/b.service").unwrap_err();
        assert!(err.is_character_error());
        assert!(matches!(err, IdError::InvalidCharacter { found: '/', .. }));
    }

    #[test]
    fn test_machine_id_rejects_whitespace() {
        let err = MachineId::parse("m 1").unwrap_err();
        assert!(matches!(err, IdError::InvalidCharacter { found: ' ', .. }));
    }

    #[test]
    fn test_name_too_long() {
        let long = "x".repeat(crate::MAX_NAME_LEN + 1);
        assert!(matches!(
            MachineId::parse(&long),
            Err(IdError::TooLong { .. })
        ));
    }

    #[test]
    fn test_unit_name_json_validates() {
        let parsed: Result<UnitName, _> = serde_json::from_str("\"bad/name\"");
        assert!(parsed.is_err());

        let name = UnitName::parse("db@1.service").unwrap();
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"db@1.service\"");
    }

    #[test]
    fn test_engine_id_roundtrip() {
        let id = EngineId::new();
        let s = id.to_string();
        assert!(s.starts_with("eng_"));
        let parsed: EngineId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_engine_id_invalid_prefix() {
        let result: Result<EngineId, _> = "mach_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result.unwrap_err(), IdError::InvalidPrefix { .. }));
    }

    #[test]
    fn test_engine_id_missing_separator() {
        let result: Result<EngineId, _> = "eng01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result.unwrap_err(), IdError::MissingSeparator));
    }

    proptest! {
        #[test]
        fn prop_valid_names_roundtrip(s in "[A-Za-z0-9@._:-]{1,64}") {
            let name = UnitName::parse(&s).unwrap();
            prop_assert_eq!(name.to_string(), s);
        }

        #[test]
        fn prop_names_with_slash_rejected(a in "[a-z]{0,8}", b in "[a-z]{0,8}") {
            let s = format!("{a}/{b}");
            prop_assert!(MachineId::parse(&s).is_err());
        }
    }
}
