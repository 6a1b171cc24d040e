//! Path conventions used by registry callers.
//!
//! These are conventions only; drivers treat every path as an opaque
//! slash-separated key and do not enforce this layout.

/// `images/<image-id>/manifest.json`
pub fn image_manifest_path(image_id: &str) -> String {
    format!("images/{image_id}/manifest.json")
}

/// `images/<image-id>/_private`
pub fn image_private_path(image_id: &str) -> String {
    format!("images/{image_id}/_private")
}

/// `images/<image-id>/_deleted`
pub fn image_deletion_path(image_id: &str) -> String {
    format!("images/{image_id}/_deleted")
}

/// `layers/<layer-digest>/layer`
pub fn image_layer_path(layer_digest: &str) -> String {
    format!("layers/{layer_digest}/layer")
}

/// `layers/<layer-digest>/checksum`
pub fn layer_checksum_path(layer_digest: &str) -> String {
    format!("layers/{layer_digest}/checksum")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(image_manifest_path("abc"), "images/abc/manifest.json");
        assert_eq!(image_private_path("abc"), "images/abc/_private");
        assert_eq!(image_deletion_path("abc"), "images/abc/_deleted");
        assert_eq!(image_layer_path("deadbeef"), "layers/deadbeef/layer");
        assert_eq!(layer_checksum_path("deadbeef"), "layers/deadbeef/checksum");
    }
}
