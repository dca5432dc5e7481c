//! Pure projections of a [`SyncDocument`] for the two reader roles.

use crate::document::SyncDocument;

/// View for an authenticated admin device: the plaintext assistant key is
/// blanked, everything else — including encrypted blobs — is preserved so
/// the device can decrypt locally.
pub fn admin_view(doc: &SyncDocument) -> SyncDocument {
    let mut out = doc.clone();
    if let Some(assistant) = out.assistant.as_mut() {
        assistant.api_key = Some(String::new());
    }
    out
}

/// View for everyone else: the admin clearing plus unconditional removal of
/// every privacy-adjacent field, so neither ciphertext nor its metadata
/// reaches a non-admin reader.
pub fn public_view(doc: &SyncDocument) -> SyncDocument {
    let mut out = admin_view(doc);
    out.vault = None;
    out.encrypted_settings = None;
    out.privacy = None;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::AssistantSettings;
    use serde_json::json;

    fn loaded_document() -> SyncDocument {
        let mut doc = SyncDocument::default();
        doc.links = vec![json!({"url": "https://example.com"})];
        doc.vault = Some(json!({"ciphertext": "AAAA", "iv": "BBBB"}));
        doc.encrypted_settings = Some("CCCC".to_string());
        doc.privacy = Some(json!({"hideVault": true}));
        doc.assistant = Some(AssistantSettings {
            api_key: Some("sk-secret".to_string()),
            rest: serde_json::Map::new(),
        });
        doc
    }

    #[test]
    fn admin_view_blanks_only_the_plaintext_secret() {
        let doc = loaded_document();
        let view = admin_view(&doc);

        assert_eq!(view.assistant.as_ref().unwrap().api_key.as_deref(), Some(""));
        assert!(view.vault.is_some());
        assert!(view.encrypted_settings.is_some());
        assert!(view.privacy.is_some());

        // Pure: the input is untouched.
        assert_eq!(doc.assistant.as_ref().unwrap().api_key.as_deref(), Some("sk-secret"));
    }

    #[test]
    fn public_view_strips_all_privacy_fields() {
        let view = public_view(&loaded_document());

        assert!(view.vault.is_none());
        assert!(view.encrypted_settings.is_none());
        assert!(view.privacy.is_none());
        assert_eq!(view.assistant.as_ref().unwrap().api_key.as_deref(), Some(""));
        // Non-sensitive payload survives.
        assert_eq!(view.links.len(), 1);
    }

    #[test]
    fn views_are_total_on_minimal_documents() {
        let doc = SyncDocument::default();
        let admin = admin_view(&doc);
        let public = public_view(&doc);
        assert!(admin.assistant.is_none());
        assert!(public.assistant.is_none());
    }
}
