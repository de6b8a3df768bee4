use crate::error::FleetError;
use crate::types::{Instance, SpotRequest};

/// Closed-key-set / type-shape validation for rows about to be inserted.
///
/// The Rust type system already closes the key set and pins down field
/// types at compile time (there is no "extraneous key" a caller can smuggle
/// past `Instance`/`SpotRequest`), so what remains here is the runtime
/// shape spec.md still calls out explicitly: required strings must be
/// non-empty and timestamps must be chronologically sane. A failure here is
/// a programmer error in the caller — it must abort before the Store issues
/// any SQL.
pub fn validate_instance(i: &Instance) -> Result<(), FleetError> {
    require_nonempty("region", &i.region)?;
    require_nonempty("id", &i.id)?;
    require_nonempty("worker_type", &i.worker_type)?;
    require_nonempty("availability_zone", &i.availability_zone)?;
    require_nonempty("instance_type", &i.instance_type)?;
    require_nonempty("image_id", &i.image_id)?;
    if i.last_event < i.launched {
        return Err(FleetError::Validation(
            "last_event precedes launched".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_spot_request(r: &SpotRequest) -> Result<(), FleetError> {
    require_nonempty("region", &r.region)?;
    require_nonempty("id", &r.id)?;
    require_nonempty("worker_type", &r.worker_type)?;
    require_nonempty("availability_zone", &r.availability_zone)?;
    require_nonempty("instance_type", &r.instance_type)?;
    require_nonempty("image_id", &r.image_id)?;
    Ok(())
}

fn require_nonempty(field: &str, value: &str) -> Result<(), FleetError> {
    if value.trim().is_empty() {
        return Err(FleetError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_instance() -> Instance {
        Instance {
            region: "us-east-1".into(),
            id: "i-abc".into(),
            worker_type: "gecko-t-win10-64".into(),
            availability_zone: "us-east-1a".into(),
            instance_type: "m5.large".into(),
            state: crate::types::InstanceState::Running,
            image_id: "ami-1".into(),
            launched: Utc::now(),
            last_event: Utc::now(),
            source_request_id: None,
        }
    }

    #[test]
    fn rejects_blank_worker_type() {
        let mut i = sample_instance();
        i.worker_type = "  ".to_string();
        assert!(validate_instance(&i).is_err());
    }

    #[test]
    fn rejects_last_event_before_launch() {
        let mut i = sample_instance();
        i.last_event = i.launched - chrono::Duration::seconds(5);
        assert!(validate_instance(&i).is_err());
    }

    #[test]
    fn accepts_well_formed_instance() {
        assert!(validate_instance(&sample_instance()).is_ok());
    }
}
