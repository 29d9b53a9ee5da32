use std::path::Path;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use tracing::{info, warn};

use crate::platform::whatsapp::{EvolutionClient, PairingInfo};

/// Decode a QR image (data URL or bare base64 PNG) and write it to `path`
/// for the operator to scan.
pub fn save_qr_code(qr: &str, path: &Path) -> Result<()> {
    let encoded = match qr.split_once("base64,") {
        Some((_, data)) => data,
        None => qr,
    };

    let png = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .context("QR code is not valid base64")?;

    std::fs::write(path, png)
        .with_context(|| format!("Failed to write QR code to {}", path.display()))?;

    info!(
        "QR Code received, scan {} with WhatsApp on your phone",
        path.display()
    );
    Ok(())
}

/// Render the raw QR payload (the `2@...` string) as terminal text.
pub fn render_qr(code: &str) -> Result<String> {
    let payload = code.trim();
    if payload.is_empty() {
        anyhow::bail!("QR payload is empty");
    }

    let qr = qrcode::QrCode::new(payload.as_bytes())
        .map_err(|err| anyhow!("Failed to encode WhatsApp Web QR payload: {err}"))?;

    Ok(qr
        .render::<qrcode::render::unicode::Dense1x2>()
        .quiet_zone(true)
        .build())
}

/// Show a fresh QR code: printed to the terminal when the raw payload is
/// known, and saved as a PNG when the bridge sent an image. Returns false
/// when there was nothing to show.
pub fn show_qr(pairing: &PairingInfo, path: &Path) -> bool {
    let mut shown = false;

    if let Some(code) = pairing.code.as_deref().filter(|c| !c.trim().is_empty()) {
        match render_qr(code) {
            Ok(rendered) => {
                println!("{}", rendered);
                info!("Scan the QR code above with WhatsApp on your phone");
                shown = true;
            }
            Err(e) => warn!("Could not render pairing QR code: {:#}", e),
        }
    }

    if let Some(qr) = pairing.base64.as_deref().filter(|qr| !qr.is_empty()) {
        match save_qr_code(qr, path) {
            Ok(()) => shown = true,
            Err(e) => warn!("Could not save pairing QR code: {:#}", e),
        }
    }

    shown
}

/// Start pairing on boot. Never fatal: the bridge keeps pushing fresh QR
/// codes through the webhook.
pub async fn start(client: &EvolutionClient, qr_path: &Path) {
    match client.connect().await {
        Ok(pairing) => {
            if let Some(code) = pairing.pairing_code.as_deref().filter(|c| !c.is_empty()) {
                info!("WhatsApp pairing code: {}", code);
            }
            if !show_qr(&pairing, qr_path) {
                info!("WhatsApp instance already paired");
            }
        }
        Err(e) => warn!("Could not start WhatsApp pairing: {:#}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 1x1 transparent PNG
    const PNG_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("xenovia-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_save_data_url() {
        let path = temp_path("qr-data-url.png");
        save_qr_code(&format!("data:image/png;base64,{}", PNG_B64), &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_save_bare_base64() {
        let path = temp_path("qr-bare.png");
        save_qr_code(PNG_B64, &path).unwrap();

        assert_eq!(&std::fs::read(&path).unwrap()[1..4], b"PNG");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let path = temp_path("qr-invalid.png");
        assert!(save_qr_code("data:image/png;base64,@@not-base64@@", &path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_render_qr_rejects_empty_payload() {
        assert!(render_qr("").is_err());
        assert!(render_qr("   ").is_err());
    }

    #[test]
    fn test_render_qr_outputs_multiline_text() {
        let rendered = render_qr("2@AbCdEfGh,IjKlMnOp,QrStUvWx,YzAbCdEf").unwrap();
        assert!(rendered.lines().count() > 10);
        assert!(rendered.contains('█') || rendered.contains('▀') || rendered.contains('▄'));
    }

    #[test]
    fn test_show_qr_without_image_or_payload_shows_nothing() {
        let path = temp_path("qr-nothing.png");
        assert!(!show_qr(&PairingInfo::default(), &path));
        assert!(!path.exists());
    }

    #[test]
    fn test_show_qr_renders_payload_and_saves_image() {
        let path = temp_path("qr-both.png");
        let pairing = PairingInfo {
            base64: Some(format!("data:image/png;base64,{}", PNG_B64)),
            code: Some("2@AbCdEfGh,IjKlMnOp".to_string()),
            pairing_code: None,
        };

        assert!(show_qr(&pairing, &path));
        assert_eq!(&std::fs::read(&path).unwrap()[1..4], b"PNG");
        std::fs::remove_file(&path).ok();
    }
}
