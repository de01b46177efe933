//! On-disk image store.
//!
//! ```text
//! <store>/
//!   bases/<name>/<tag>/rootfs/     imported base trees (read-only to builds)
//!   bases/<name>/<tag>/base.json
//!   images/<id>/rootfs/            published environment images
//!   images/<id>/layers/NNN.json
//!   images/<id>/image.json
//!   tags/<tag>                     file holding an image id
//!   work/<uuid>/                   in-progress builds
//! ```
//!
//! # Atomicity
//!
//! Builds happen in a private `work/<uuid>` directory. Only after every step
//! and verification has passed is it renamed into `images/<id>`. A
//! [`WorkDir`] that is dropped without being published deletes itself, so a
//! failed or cancelled build leaves nothing behind.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::layer::{Layer, Snapshot};
use super::{validate_tag, BaseImage, BaseRecord, EnvironmentImage};

const IMAGE_METADATA: &str = "image.json";
const BASE_METADATA: &str = "base.json";

pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Open the store, creating its directory layout if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(root);
        for dir in [
            store.bases_dir(),
            store.images_dir(),
            store.tags_dir(),
            store.work_root(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create store directory {}", dir.display()))?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bases_dir(&self) -> PathBuf {
        self.root.join("bases")
    }

    fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    fn tags_dir(&self) -> PathBuf {
        self.root.join("tags")
    }

    fn work_root(&self) -> PathBuf {
        self.root.join("work")
    }

    // =========================================================================
    // Base images
    // =========================================================================

    fn base_dir(&self, base: &BaseImage) -> PathBuf {
        self.bases_dir().join(&base.name).join(&base.tag)
    }

    pub fn base_rootfs(&self, base: &BaseImage) -> PathBuf {
        self.base_dir(base).join("rootfs")
    }

    /// Metadata of an imported base, `None` if it was never imported.
    pub fn base_record(&self, base: &BaseImage) -> Result<Option<BaseRecord>> {
        let path = self.base_dir(base).join(BASE_METADATA);
        if !path.exists() || !self.base_rootfs(base).is_dir() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Copy `source` into the store as `base`.
    pub fn import_base(&self, base: &BaseImage, source: &Path) -> Result<BaseRecord> {
        if !source.is_dir() {
            bail!("Base source {} is not a directory", source.display());
        }
        let dir = self.base_dir(base);
        if dir.exists() {
            bail!(
                "Base image {} already imported at {}\n\
                 Remove it first with 'envbuild base rm {}'",
                base,
                dir.display(),
                base
            );
        }

        let staging = dir.with_file_name(format!(".{}.importing", base.tag));
        let _ = fs::remove_dir_all(&staging);
        let result = (|| -> Result<BaseRecord> {
            let rootfs = staging.join("rootfs");
            copy_tree(source, &rootfs)
                .with_context(|| format!("Failed to copy {} into store", source.display()))?;
            let digest = Snapshot::capture(&rootfs)
                .context("Failed to snapshot base rootfs")?
                .digest();
            let record = BaseRecord {
                base: base.clone(),
                digest,
                imported_at: Utc::now(),
            };
            write_json(&staging.join(BASE_METADATA), &record)?;
            Ok(record)
        })();

        match result {
            Ok(record) => {
                fs::rename(&staging, &dir)
                    .with_context(|| format!("Failed to move base into {}", dir.display()))?;
                tracing::info!(base = %base, digest = %record.digest, "imported base image");
                Ok(record)
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                Err(e)
            }
        }
    }

    pub fn remove_base(&self, base: &BaseImage) -> Result<()> {
        let dir = self.base_dir(base);
        if !dir.exists() {
            bail!("Base image {} not found", base);
        }
        fs::remove_dir_all(&dir).with_context(|| format!("Failed to remove {}", dir.display()))
    }

    pub fn list_bases(&self) -> Result<Vec<BaseRecord>> {
        let mut records = Vec::new();
        collect_base_records(&self.bases_dir(), &mut records)?;
        records.sort_by(|a, b| a.base.to_string().cmp(&b.base.to_string()));
        Ok(records)
    }

    // =========================================================================
    // Builds
    // =========================================================================

    /// Create a fresh private work directory with an empty `rootfs/`.
    pub fn begin_work(&self) -> Result<WorkDir> {
        let path = self.work_root().join(uuid::Uuid::new_v4().to_string());
        fs::create_dir_all(path.join("rootfs"))
            .with_context(|| format!("Failed to create work directory {}", path.display()))?;
        Ok(WorkDir {
            path,
            published: false,
        })
    }

    /// Write metadata and layers into `work`, then move it to `images/<id>`
    /// and point the tag (if any) at it.
    ///
    /// The id is a content digest, so an image already stored under it has
    /// the same content. It is kept as is and `work` is discarded.
    pub fn publish(
        &self,
        mut work: WorkDir,
        image: &EnvironmentImage,
        layers: &[Layer],
    ) -> Result<PathBuf> {
        let target = self.images_dir().join(&image.id);
        if target.exists() {
            tracing::info!(id = %image.id, "identical image already in store");
        } else {
            let layers_dir = work.path.join("layers");
            fs::create_dir_all(&layers_dir)?;
            for layer in layers {
                write_json(
                    &layers_dir.join(format!("{:03}-{}.json", layer.index, layer.kind)),
                    layer,
                )?;
            }
            write_json(&work.path.join(IMAGE_METADATA), image)?;

            match fs::rename(&work.path, &target) {
                Ok(()) => work.published = true,
                // Lost a race with an identical build.
                Err(_) if target.join(IMAGE_METADATA).is_file() => {
                    tracing::info!(id = %image.id, "identical image published concurrently");
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!(
                            "Failed to move {} to {}",
                            work.path.display(),
                            target.display()
                        )
                    })
                }
            }
        }

        if let Some(tag) = &image.tag {
            self.set_tag(tag, &image.id)?;
        }
        Ok(target)
    }

    // =========================================================================
    // Images and tags
    // =========================================================================

    pub fn image_dir(&self, id: &str) -> PathBuf {
        self.images_dir().join(id)
    }

    pub fn image_rootfs(&self, id: &str) -> PathBuf {
        self.image_dir(id).join("rootfs")
    }

    pub fn load_image(&self, id: &str) -> Result<EnvironmentImage> {
        let path = self.image_dir(id).join(IMAGE_METADATA);
        read_json(&path).with_context(|| format!("Image {} not found or unreadable", id))
    }

    /// Resolve an image id or tag.
    pub fn resolve(&self, reference: &str) -> Result<EnvironmentImage> {
        if self.image_dir(reference).join(IMAGE_METADATA).exists() {
            return self.load_image(reference);
        }
        match self.read_tag(reference)? {
            Some(id) => self.load_image(&id),
            None => bail!("No image or tag named '{}'", reference),
        }
    }

    pub fn set_tag(&self, tag: &str, id: &str) -> Result<()> {
        validate_tag(tag)?;
        let path = self.tags_dir().join(tag);
        let tmp = self.tags_dir().join(format!(".{}.tmp", tag));
        fs::write(&tmp, format!("{}\n", id))?;
        fs::rename(&tmp, &path).with_context(|| format!("Failed to write tag {}", tag))
    }

    pub fn read_tag(&self, tag: &str) -> Result<Option<String>> {
        if validate_tag(tag).is_err() {
            return Ok(None);
        }
        let path = self.tags_dir().join(tag);
        if !path.exists() {
            return Ok(None);
        }
        let id = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read tag {}", tag))?
            .trim()
            .to_string();
        Ok(Some(id))
    }

    pub fn list_images(&self) -> Result<Vec<EnvironmentImage>> {
        let dir = self.images_dir();
        let mut images = Vec::new();
        if !dir.exists() {
            return Ok(images);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.path().join(IMAGE_METADATA).exists() {
                let id = entry.file_name().to_string_lossy().into_owned();
                images.push(self.load_image(&id)?);
            }
        }
        images.sort_by(|a, b| b.built_at.cmp(&a.built_at));
        Ok(images)
    }

    /// Remove an image and every tag pointing at it.
    pub fn remove(&self, reference: &str) -> Result<EnvironmentImage> {
        let image = self.resolve(reference)?;
        for entry in fs::read_dir(self.tags_dir())? {
            let entry = entry?;
            let tag = entry.file_name().to_string_lossy().into_owned();
            if self.read_tag(&tag)?.as_deref() == Some(image.id.as_str()) {
                fs::remove_file(entry.path())?;
            }
        }
        fs::remove_dir_all(self.image_dir(&image.id))
            .with_context(|| format!("Failed to remove image {}", image.id))?;
        Ok(image)
    }

    /// Work directories left over from killed processes.
    pub fn stale_work_dirs(&self) -> Result<Vec<PathBuf>> {
        let dir = self.work_root();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut stale = Vec::new();
        for entry in fs::read_dir(&dir)? {
            stale.push(entry?.path());
        }
        Ok(stale)
    }
}

fn collect_base_records(dir: &Path, out: &mut Vec<BaseRecord>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    let metadata = dir.join(BASE_METADATA);
    if metadata.exists() {
        out.push(read_json(&metadata)?);
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let hidden = path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with('.'));
        if path.is_dir() && !hidden {
            collect_base_records(&path, out)?;
        }
    }
    Ok(())
}

/// A build's private directory; deleted on drop unless published.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
    published: bool,
}

impl WorkDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rootfs(&self) -> PathBuf {
        self.path.join("rootfs")
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if !self.published {
            if let Err(e) = fs::remove_dir_all(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to remove work directory");
                }
            }
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// Copy a directory tree, preserving symlinks and permission bits.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)?;
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path)?;
            std::os::unix::fs::symlink(&target, &dst_path)?;
        } else if file_type.is_dir() {
            copy_tree(&src_path, &dst_path)?;
        } else if file_type.is_file() {
            fs::copy(&src_path, &dst_path).with_context(|| {
                format!(
                    "copying {} to {}",
                    src_path.display(),
                    dst_path.display()
                )
            })?;
        } else {
            tracing::warn!(path = %src_path.display(), "skipping special file");
        }
    }

    fs::set_permissions(dst, fs::Permissions::from_mode(meta.permissions().mode()))?;
    Ok(())
}
