use crate::domain::PreparedImage;
use enroll_common::domain::{DomainError, DomainResult, EnrollmentId};
use serde::{Deserialize, Serialize};

pub const SET_USER_INFO_COMMAND: &str = "setuserinfo";

/// Backup slot the device stores face templates under
pub const FACE_BACKUP_NUM: u32 = 50;

/// Exact `setuserinfo` command body published to `aiface/{deviceId}/pub`.
///
/// The device firmware rejects unknown keys, so the field set is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnrollmentPayload {
    pub cmd: String,
    pub enrollid: u32,
    pub name: String,
    pub backupnum: u32,
    pub admin: u32,
    pub record: String,
}

impl EnrollmentPayload {
    pub fn to_bytes(&self) -> DomainResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Assemble the command for one enrollment attempt.
///
/// `record` must be bare base64 (no `data:` prefix).
pub fn build_payload(enroll_id: EnrollmentId, subject_name: &str, record: &str) -> EnrollmentPayload {
    EnrollmentPayload {
        cmd: SET_USER_INFO_COMMAND.to_string(),
        enrollid: enroll_id.value(),
        name: subject_name.to_string(),
        backupnum: FACE_BACKUP_NUM,
        admin: 0,
        record: record.to_string(),
    }
}

/// Build the payload from a prepared image, refusing an empty record
pub fn prepare_enrollment(
    enroll_id: EnrollmentId,
    subject_name: &str,
    image: &PreparedImage,
) -> DomainResult<EnrollmentPayload> {
    if image.record.is_empty() {
        return Err(DomainError::MissingImageRecord);
    }
    Ok(build_payload(enroll_id, subject_name.trim(), &image.record))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepared(record: &str) -> PreparedImage {
        PreparedImage {
            jpeg: vec![0xFF, 0xD8],
            record: record.to_string(),
            width: 1,
            height: 1,
        }
    }

    #[test]
    fn test_payload_has_exactly_six_fields() {
        let payload = build_payload(EnrollmentId::new(150).unwrap(), "Jane Doe", "QUJD");
        let json = serde_json::to_value(&payload).unwrap();
        let object = json.as_object().unwrap();

        assert_eq!(object.len(), 6);
        assert_eq!(json["cmd"], "setuserinfo");
        assert_eq!(json["enrollid"], 150);
        assert_eq!(json["name"], "Jane Doe");
        assert_eq!(json["backupnum"], 50);
        assert_eq!(json["admin"], 0);
        assert_eq!(json["record"], "QUJD");
    }

    #[test]
    fn test_payload_rejects_extra_fields() {
        let raw = r#"{"cmd":"setuserinfo","enrollid":150,"name":"J","backupnum":50,"admin":0,"record":"x","extra":1}"#;
        assert!(serde_json::from_str::<EnrollmentPayload>(raw).is_err());
    }

    #[test]
    fn test_prepare_enrollment_validation() {
        let id = EnrollmentId::new(200).unwrap();

        assert!(matches!(
            prepare_enrollment(id, "Jane", &prepared("")),
            Err(DomainError::MissingImageRecord)
        ));

        let payload = prepare_enrollment(id, "  Jane ", &prepared("QUJD")).unwrap();
        assert_eq!(payload.name, "Jane");
        assert_eq!(payload.enrollid, 200);

        let unnamed = prepare_enrollment(id, "", &prepared("QUJD")).unwrap();
        assert_eq!(unnamed.name, "");
    }
}
