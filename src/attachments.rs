//! Attachment handling for multimodal questions.
//!
//! Attachments arrive pre-processed by an external collaborator as
//! [`ProcessedFile`]s: images carry a data URI, documents carry extracted
//! text. Per panelist, a multi-part message is assembled: vision-capable
//! endpoints get the image itself; text-only endpoints get a description
//! generated once up front by an auxiliary endpoint.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::config::QuorumConfig;
use crate::error::{QuorumError, Result};
use crate::upstream::{
    with_retry, ChatMessage, ContentPart, ImageUrl, RetryPolicy, Upstream, UpstreamRequest,
};

/// Attachment category after external pre-processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Document,
}

/// One pre-processed attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedFile {
    pub filename: String,
    pub kind: AttachmentKind,
    /// Data URI; present for images.
    pub data_uri: Option<String>,
    /// Extracted text; present for documents.
    pub extracted_text: Option<String>,
}

/// Validate attachment shape and count. Runs before any credits are touched.
pub fn validate_attachments(files: &[ProcessedFile], config: &QuorumConfig) -> Result<()> {
    if files.len() > config.max_attachments {
        return Err(QuorumError::InvalidInput(format!(
            "too many attachments: {} (max {})",
            files.len(),
            config.max_attachments
        )));
    }
    for file in files {
        match file.kind {
            AttachmentKind::Image if file.data_uri.is_none() => {
                return Err(QuorumError::InvalidInput(format!(
                    "image attachment {:?} has no data URI",
                    file.filename
                )));
            }
            AttachmentKind::Document if file.extracted_text.is_none() => {
                return Err(QuorumError::InvalidInput(format!(
                    "document attachment {:?} has no extracted text",
                    file.filename
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

fn unavailable_description(filename: &str) -> String {
    format!("[Image: {filename} - description unavailable]")
}

/// Build the message for one panelist: the question text, then each
/// attachment as an image part (vision endpoints), an inlined description
/// (text-only endpoints), or inlined document text.
pub fn build_multimodal_message(
    question: &str,
    files: &[ProcessedFile],
    model: &str,
    vision_models: &HashSet<String>,
    image_descriptions: &HashMap<String, String>,
) -> ChatMessage {
    let is_vision = vision_models.contains(model);
    let mut parts = vec![ContentPart::Text {
        text: question.to_string(),
    }];

    for file in files {
        match file.kind {
            AttachmentKind::Image => {
                if is_vision {
                    if let Some(uri) = &file.data_uri {
                        parts.push(ContentPart::ImageUrl {
                            image_url: ImageUrl { url: uri.clone() },
                        });
                        continue;
                    }
                }
                let description = image_descriptions
                    .get(&file.filename)
                    .cloned()
                    .unwrap_or_else(|| unavailable_description(&file.filename));
                parts.push(ContentPart::Text {
                    text: format!("\n\n[ATTACHED IMAGE: {}]\n{}", file.filename, description),
                });
            }
            AttachmentKind::Document => {
                let text = file
                    .extracted_text
                    .as_deref()
                    .unwrap_or("[Document content unavailable]");
                parts.push(ContentPart::Text {
                    text: format!("\n\n[ATTACHED DOCUMENT: {}]\n{}", file.filename, text),
                });
            }
        }
    }

    ChatMessage::user_parts(parts)
}

/// Whether any panelist in the pool will need textual image descriptions.
pub fn needs_image_descriptions(
    files: &[ProcessedFile],
    models: &[String],
    vision_models: &HashSet<String>,
) -> bool {
    files.iter().any(|f| f.kind == AttachmentKind::Image)
        && models.iter().any(|m| !vision_models.contains(m))
}

/// Describe every image attachment through the auxiliary endpoint, all in
/// parallel. Failures degrade to an "unavailable" placeholder per image.
pub async fn describe_images(
    upstream: &Arc<dyn Upstream>,
    policy: &RetryPolicy,
    describe_model: &str,
    files: &[ProcessedFile],
) -> HashMap<String, String> {
    let images: Vec<&ProcessedFile> = files
        .iter()
        .filter(|f| f.kind == AttachmentKind::Image && f.data_uri.is_some())
        .collect();

    let tasks = images.iter().map(|file| {
        let uri = file.data_uri.clone().unwrap_or_default();
        let request = UpstreamRequest {
            model: describe_model.to_string(),
            messages: vec![ChatMessage::user_parts(vec![
                ContentPart::Text {
                    text: "Describe this image in detail so that a text-only model can \
                           reason about its contents. Mention any text, numbers, charts, \
                           or diagrams it contains."
                        .to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url: uri },
                },
            ])],
        };
        let filename = file.filename.clone();
        async move {
            match with_retry(upstream, &request, policy, None).await {
                Ok(response) => (filename, response.text),
                Err(e) => {
                    tracing::warn!(filename = %filename, error = %e, "image description failed");
                    let fallback = unavailable_description(&filename);
                    (filename, fallback)
                }
            }
        }
    });

    join_all(tasks).await.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{MessageContent, MockUpstream};

    fn image(filename: &str) -> ProcessedFile {
        ProcessedFile {
            filename: filename.into(),
            kind: AttachmentKind::Image,
            data_uri: Some(format!("data:image/png;base64,{filename}")),
            extracted_text: None,
        }
    }

    fn document(filename: &str, text: &str) -> ProcessedFile {
        ProcessedFile {
            filename: filename.into(),
            kind: AttachmentKind::Document,
            data_uri: None,
            extracted_text: Some(text.into()),
        }
    }

    fn vision(models: &[&str]) -> HashSet<String> {
        models.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_vision_model_gets_image_part() {
        let msg = build_multimodal_message(
            "what is this?",
            &[image("chart.png")],
            "v/vision",
            &vision(&["v/vision"]),
            &HashMap::new(),
        );
        let MessageContent::Parts(parts) = &msg.content else {
            panic!("expected parts");
        };
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[1], ContentPart::ImageUrl { image_url }
            if image_url.url.contains("chart.png")));
    }

    #[test]
    fn test_text_only_model_gets_description() {
        let mut descriptions = HashMap::new();
        descriptions.insert("chart.png".to_string(), "a bar chart".to_string());
        let msg = build_multimodal_message(
            "what is this?",
            &[image("chart.png")],
            "v/text-only",
            &vision(&["v/vision"]),
            &descriptions,
        );
        let MessageContent::Parts(parts) = &msg.content else {
            panic!("expected parts");
        };
        assert!(matches!(&parts[1], ContentPart::Text { text }
            if text.contains("[ATTACHED IMAGE: chart.png]") && text.contains("a bar chart")));
    }

    #[test]
    fn test_missing_description_uses_placeholder() {
        let msg = build_multimodal_message(
            "q",
            &[image("x.png")],
            "v/text-only",
            &vision(&[]),
            &HashMap::new(),
        );
        let MessageContent::Parts(parts) = &msg.content else {
            panic!("expected parts");
        };
        assert!(matches!(&parts[1], ContentPart::Text { text }
            if text.contains("description unavailable")));
    }

    #[test]
    fn test_document_inlined_for_all_models() {
        for model in ["v/vision", "v/text-only"] {
            let msg = build_multimodal_message(
                "q",
                &[document("notes.pdf", "the contents")],
                model,
                &vision(&["v/vision"]),
                &HashMap::new(),
            );
            let MessageContent::Parts(parts) = &msg.content else {
                panic!("expected parts");
            };
            assert!(matches!(&parts[1], ContentPart::Text { text }
                if text.contains("[ATTACHED DOCUMENT: notes.pdf]") && text.contains("the contents")));
        }
    }

    #[test]
    fn test_validation_caps_and_shape() {
        let config = QuorumConfig::default();
        let too_many: Vec<ProcessedFile> = (0..6).map(|i| image(&format!("{i}.png"))).collect();
        assert!(validate_attachments(&too_many, &config).is_err());

        let bad_image = ProcessedFile {
            filename: "x.png".into(),
            kind: AttachmentKind::Image,
            data_uri: None,
            extracted_text: None,
        };
        assert!(validate_attachments(&[bad_image], &config).is_err());
        assert!(validate_attachments(&[image("ok.png"), document("d.pdf", "t")], &config).is_ok());
    }

    #[test]
    fn test_needs_image_descriptions() {
        let models = vec!["v/vision".to_string(), "v/text-only".to_string()];
        let all_vision = vec!["v/vision".to_string()];
        let vm = vision(&["v/vision"]);
        assert!(needs_image_descriptions(&[image("a.png")], &models, &vm));
        assert!(!needs_image_descriptions(&[image("a.png")], &all_vision, &vm));
        assert!(!needs_image_descriptions(
            &[document("d.pdf", "t")],
            &models,
            &vm
        ));
    }

    #[tokio::test]
    async fn test_describe_images_parallel_with_fallback() {
        let mock = MockUpstream::new();
        mock.script_text("v/describe", "a detailed description");
        // second image: script runs out, no default -> fallback text
        let upstream: Arc<dyn Upstream> = Arc::new(mock);

        let files = vec![image("a.png"), image("b.png")];
        let descriptions = describe_images(
            &upstream,
            &RetryPolicy::none(),
            "v/describe",
            &files,
        )
        .await;

        assert_eq!(descriptions.len(), 2);
        let described: Vec<&String> = descriptions.values().collect();
        assert!(described.iter().any(|d| d.contains("a detailed description")));
        assert!(described.iter().any(|d| d.contains("description unavailable")));
    }
}
