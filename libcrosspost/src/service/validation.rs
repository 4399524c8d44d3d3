//! Synchronous checks on publish requests
//!
//! Anything rejected here never reaches storage, the scheduler or the
//! executor.

use crate::error::{CrosspostError, Result};
use crate::platforms::PlatformRegistry;

use super::PublishRequest;

pub fn validate_request(request: &PublishRequest, registry: &PlatformRegistry) -> Result<()> {
    if request.targets.is_empty() {
        return Err(CrosspostError::Validation(
            "At least one target platform is required".to_string(),
        ));
    }

    let unknown: Vec<&str> = request
        .targets
        .iter()
        .filter(|t| !registry.contains(t))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        return Err(CrosspostError::Validation(format!(
            "Unknown platform(s): {} (configured: {})",
            unknown.join(", "),
            registry.names().join(", ")
        )));
    }

    if request.title.trim().is_empty()
        && request.body.trim().is_empty()
        && request.media_refs.is_empty()
    {
        return Err(CrosspostError::Validation(
            "Nothing to publish: title, body and media are all empty".to_string(),
        ));
    }

    if request.media_refs.iter().any(|m| m.trim().is_empty()) {
        return Err(CrosspostError::Validation(
            "Media references cannot be blank".to_string(),
        ));
    }

    if request.draft && request.scheduled_at.is_some() {
        return Err(CrosspostError::Validation(
            "A draft cannot carry a publish time; reschedule it instead".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::mock::MockPlatform;

    fn registry() -> PlatformRegistry {
        let mut registry = PlatformRegistry::new();
        registry.register(MockPlatform::success("facebook"));
        registry.register(MockPlatform::success("youtube"));
        registry
    }

    fn request(targets: &[&str]) -> PublishRequest {
        PublishRequest {
            title: "Title".to_string(),
            body: "Body".to_string(),
            targets: targets.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_request() {
        assert!(validate_request(&request(&["facebook", "youtube"]), &registry()).is_ok());
    }

    #[test]
    fn test_empty_targets_rejected() {
        let err = validate_request(&request(&[]), &registry()).unwrap_err();
        assert!(matches!(err, CrosspostError::Validation(_)));
    }

    #[test]
    fn test_unknown_platform_rejected() {
        let err = validate_request(&request(&["facebook", "myspace"]), &registry()).unwrap_err();
        assert!(err.to_string().contains("myspace"));
        assert!(!err.to_string().contains("Unknown platform(s): facebook"));
    }

    #[test]
    fn test_empty_content_rejected() {
        let mut req = request(&["facebook"]);
        req.title = String::new();
        req.body = "  ".to_string();
        assert!(validate_request(&req, &registry()).is_err());

        req.media_refs = vec!["https://cdn.example.com/clip.mp4".to_string()];
        assert!(validate_request(&req, &registry()).is_ok());
    }

    #[test]
    fn test_blank_media_rejected() {
        let mut req = request(&["facebook"]);
        req.media_refs = vec![" ".to_string()];
        assert!(validate_request(&req, &registry()).is_err());
    }

    #[test]
    fn test_scheduled_draft_rejected() {
        let mut req = request(&["facebook"]);
        req.draft = true;
        req.scheduled_at = Some(chrono::Utc::now());
        assert!(validate_request(&req, &registry()).is_err());
    }
}
