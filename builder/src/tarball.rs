//! Docker-save format tarballs for `docker load` and tar file export.

use std::io::Write;

use lateen_core::error::{BuildError, Result};
use serde::Serialize;
use tar::{Builder, Header};

use crate::image::Image;

const CONFIG_FILE: &str = "config.json";
const MANIFEST_FILE: &str = "manifest.json";

/// `manifest.json` entry inside a docker-save tarball.
#[derive(Serialize)]
struct TarManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags")]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Write `image` as a docker-save tarball: the container config, one
/// compressed layer file per layer, and a manifest tying them together.
///
/// Every layer must carry its blob locally; tar entries are normalized
/// (mode 644, epoch mtime) so the same image always produces the same bytes.
pub fn write_tarball<W: Write>(
    image: &Image,
    config_bytes: &[u8],
    repo_tags: &[String],
    writer: W,
) -> Result<()> {
    let mut builder = Builder::new(writer);

    append_entry(&mut builder, CONFIG_FILE, config_bytes)?;

    let mut layer_names = Vec::with_capacity(image.layers.len());
    for layer in &image.layers {
        let blob = layer.blob().ok_or_else(|| {
            BuildError::Other(format!(
                "layer {} has no local content; cannot write a tarball",
                layer.digest()
            ))
        })?;
        let name = format!("{}.tar.gz", layer.digest().hash());
        append_entry(&mut builder, &name, &blob.read_all()?)?;
        layer_names.push(name);
    }

    let manifest = vec![TarManifestEntry {
        config: CONFIG_FILE.to_string(),
        repo_tags: repo_tags.to_vec(),
        layers: layer_names,
    }];
    append_entry(&mut builder, MANIFEST_FILE, &serde_json::to_vec(&manifest)?)?;

    builder
        .finish()
        .map_err(|e| BuildError::Other(format!("failed to finish image tarball: {}", e)))
}

fn append_entry<W: Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder
        .append_data(&mut header, name, bytes)
        .map_err(|e| BuildError::Other(format!("failed to add {} to tarball: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::Blob;
    use crate::cache::CachedLayer;
    use crate::digest::{BlobDescriptor, Digest};
    use crate::image::Layer;
    use std::collections::BTreeMap;
    use std::io::Read;

    fn sample_image() -> (Image, Vec<u8>) {
        let content = b"compressed layer".to_vec();
        let image = Image::builder()
            .set_architecture("amd64")
            .set_os("linux")
            .add_layer(Layer::Cached(CachedLayer {
                descriptor: BlobDescriptor::new(
                    content.len() as u64,
                    Digest::of_bytes(&content),
                ),
                diff_id: Digest::of_bytes(b"raw"),
                blob: Blob::from_bytes(content.clone()),
            }))
            .build();
        (image, content)
    }

    fn read_entries(tarball: &[u8]) -> BTreeMap<String, Vec<u8>> {
        let mut archive = tar::Archive::new(tarball);
        let mut entries = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).unwrap();
            entries.insert(name, bytes);
        }
        entries
    }

    #[test]
    fn test_tarball_layout() {
        let (image, layer_content) = sample_image();
        let config_bytes = br#"{"os":"linux"}"#;
        let tags = vec!["ghcr.io/lateen/app:v1".to_string()];

        let mut out = Vec::new();
        write_tarball(&image, config_bytes, &tags, &mut out).unwrap();
        let entries = read_entries(&out);

        assert_eq!(entries["config.json"], config_bytes);
        let layer_name = format!("{}.tar.gz", image.layers[0].digest().hash());
        assert_eq!(entries[&layer_name], layer_content);

        let manifest: serde_json::Value =
            serde_json::from_slice(&entries["manifest.json"]).unwrap();
        assert_eq!(manifest[0]["Config"], "config.json");
        assert_eq!(manifest[0]["RepoTags"][0], "ghcr.io/lateen/app:v1");
        assert_eq!(manifest[0]["Layers"][0], layer_name);
    }

    #[test]
    fn test_tarball_is_deterministic() {
        let (image, _) = sample_image();
        let tags = vec!["app:latest".to_string()];
        let mut first = Vec::new();
        let mut second = Vec::new();
        write_tarball(&image, b"{}", &tags, &mut first).unwrap();
        write_tarball(&image, b"{}", &tags, &mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_tarball_requires_local_layers() {
        let image = Image::builder()
            .add_layer(Layer::DigestOnly {
                digest: Digest::of_bytes(b"remote"),
            })
            .build();
        let err = write_tarball(&image, b"{}", &[], &mut Vec::new()).unwrap_err();
        assert!(err.to_string().contains("no local content"));
    }
}
