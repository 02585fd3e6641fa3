use crate::limits::*;
use crate::model::ReserveRequest;

use super::EngineError;

fn invalid(msg: &str) -> EngineError {
    EngineError::InvalidRequest(msg.to_string())
}

pub(crate) fn validate_id(field: &'static str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidRequest(format!("{field} must not be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(EngineError::InvalidRequest(format!("{field} too long")));
    }
    Ok(())
}

/// Shape checks for a reservation. Runs before any lock is taken.
pub(crate) fn validate_reserve(request: &ReserveRequest) -> Result<(), EngineError> {
    if request.units == 0 {
        return Err(invalid("units must be at least 1"));
    }
    if request.units > MAX_UNITS_PER_REQUEST {
        return Err(invalid("units over per-request maximum"));
    }
    validate_id("resource_id", &request.resource_id)?;
    validate_id("requester_id", &request.requester_id)?;
    if request.request_token.is_empty() {
        return Err(invalid("request_token must not be empty"));
    }
    if request.request_token.len() > MAX_TOKEN_LEN {
        return Err(invalid("request_token too long"));
    }
    if let Some(note) = &request.note
        && note.len() > MAX_NOTE_LEN
    {
        return Err(invalid("note too long"));
    }
    Ok(())
}

pub(crate) fn validate_resource(id: &str, name: Option<&str>) -> Result<(), EngineError> {
    validate_id("id", id)?;
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN
    {
        return Err(invalid("resource name too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(units: u32) -> ReserveRequest {
        ReserveRequest {
            resource_id: "fall-retreat".into(),
            requester_id: "ann@example.org".into(),
            units,
            request_token: "9f1c".into(),
            note: None,
        }
    }

    #[test]
    fn accepts_well_formed() {
        assert!(validate_reserve(&request(1)).is_ok());
        assert!(validate_reserve(&request(MAX_UNITS_PER_REQUEST)).is_ok());
    }

    #[test]
    fn zero_units_rejected() {
        assert!(matches!(
            validate_reserve(&request(0)),
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[test]
    fn oversized_party_rejected() {
        assert!(validate_reserve(&request(MAX_UNITS_PER_REQUEST + 1)).is_err());
    }

    #[test]
    fn blank_ids_rejected() {
        let mut r = request(1);
        r.requester_id = "  ".into();
        let err = validate_reserve(&r).unwrap_err();
        assert_eq!(err.to_string(), "invalid request: requester_id must not be empty");

        let mut r = request(1);
        r.request_token.clear();
        assert!(validate_reserve(&r).is_err());
    }

    #[test]
    fn long_note_rejected() {
        let mut r = request(2);
        r.note = Some("x".repeat(MAX_NOTE_LEN + 1));
        assert!(validate_reserve(&r).is_err());
    }

    #[test]
    fn resource_name_length() {
        assert!(validate_resource("e1", Some("Men's breakfast")).is_ok());
        assert!(validate_resource("e1", Some(&"n".repeat(MAX_NAME_LEN + 1))).is_err());
        assert!(validate_resource("", None).is_err());
    }
}
