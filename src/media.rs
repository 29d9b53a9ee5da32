use serde::{Deserialize, Serialize};

use crate::llm::{Blob, Part};

/// An attachment as handed over by the WhatsApp bridge: base64 payload plus
/// its MIME type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub data: String,
    pub mime_type: String,
}

/// Turn a downloaded attachment into an inline prompt part. No size or type
/// checks; the model API is the judge of what it accepts.
pub fn to_generative_part(media: &MediaAttachment) -> Part {
    Part::InlineData {
        inline_data: Blob {
            mime_type: media.mime_type.clone(),
            data: media.data.clone(),
        },
    }
}
