//! Pairing code rendering.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use qrcode::QrCode;
use qrcode::render::svg;
use qrcode::types::QrError;

use crate::store::traits::PairingCode;

const QR_MIN_SIZE: u32 = 256;

/// Render `raw` as an SVG QR code wrapped in a data URL.
pub fn encode_pairing_code(raw: &str) -> Result<PairingCode, QrError> {
    let code = QrCode::new(raw.as_bytes())?;
    let image = code
        .render::<svg::Color<'_>>()
        .min_dimensions(QR_MIN_SIZE, QR_MIN_SIZE)
        .build();

    Ok(PairingCode {
        raw: raw.to_string(),
        qr_data_url: format!("data:image/svg+xml;base64,{}", STANDARD.encode(image)),
    })
}
