use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use cairn_domain::{TypeName, Value};
use sha2::{Digest, Sha256};

use super::{Provider, TypeRegistry};
use crate::fs_util::{path_exists_including_dangling_symlink, symlink_points_to};
use crate::resource::{
    Creatable, Deletable, FieldSpec, Fields, ProviderContext, Refreshable, ResourceSchema,
    ResourceType, Updatable,
};
use crate::workflow::{StageAction, Workflow};

/// Files and symlinks on the machine running cairn.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalProvider;

impl Provider for LocalProvider {
    fn namespace(&self) -> &'static str {
        "local"
    }

    fn register(&self, registry: &mut TypeRegistry) {
        let symlink = LocalSymlink::new();
        registry.register_workflow(
            Workflow::new("relink", symlink.type_name.clone())
                .stage("unlink", StageAction::Delete)
                .stage("link", StageAction::Create),
        );
        registry.register_type(Arc::new(LocalFile::new()));
        registry.register_type(Arc::new(symlink));
    }
}

fn path_field(fields: &Fields) -> Result<PathBuf> {
    string_field(fields, "path").map(PathBuf::from)
}

fn string_field<'a>(fields: &'a Fields, name: &str) -> Result<&'a str> {
    match fields.get(name) {
        Some(Value::String(value)) => Ok(value),
        Some(other) => bail!("field `{name}` must be a string, got {}", other.type_label()),
        None => bail!("field `{name}` is not set"),
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

// ── local::file ─────────────────────────────────────────────────────

#[derive(Debug)]
pub struct LocalFile {
    type_name: TypeName,
    schema: ResourceSchema,
}

impl LocalFile {
    #[must_use]
    pub fn new() -> Self {
        Self {
            type_name: TypeName::from_static("local", "file"),
            schema: ResourceSchema::new(vec![
                FieldSpec::new("path").id(),
                FieldSpec::new("content").updatable().required(),
                FieldSpec::new("mode").updatable(),
                FieldSpec::new("sha256").output(),
            ]),
        }
    }

    fn write(fields: &mut Fields) -> Result<()> {
        let path = path_field(fields)?;
        let content = string_field(fields, "content")?.to_string();
        ensure_parent(&path)?;
        fs::write(&path, content.as_bytes())
            .with_context(|| format!("failed to write {}", path.display()))?;
        if let Some(mode) = fields.get("mode").and_then(Value::as_str) {
            set_mode(&path, parse_mode(mode)?)?;
        }
        fields.insert("sha256".to_string(), Value::from(sha256_hex(content.as_bytes())));
        Ok(())
    }
}

impl Default for LocalFile {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceType for LocalFile {
    fn type_name(&self) -> &TypeName {
        &self.type_name
    }

    fn schema(&self) -> &ResourceSchema {
        &self.schema
    }

    fn refreshable(&self) -> Option<&dyn Refreshable> {
        Some(self)
    }

    fn creatable(&self) -> Option<&dyn Creatable> {
        Some(self)
    }

    fn updatable(&self) -> Option<&dyn Updatable> {
        Some(self)
    }

    fn deletable(&self) -> Option<&dyn Deletable> {
        Some(self)
    }
}

impl Refreshable for LocalFile {
    fn refresh(&self, fields: &mut Fields, _context: &ProviderContext<'_>) -> Result<bool> {
        let path = path_field(fields)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(false),
            Err(error) => {
                return Err(anyhow!(error).context(format!("failed to read {}", path.display())));
            }
        };
        fields.insert("sha256".to_string(), Value::from(sha256_hex(&bytes)));
        fields.insert(
            "content".to_string(),
            Value::from(String::from_utf8_lossy(&bytes).into_owned()),
        );
        let recorded = fields.get("mode").and_then(Value::as_str).map(parse_mode);
        if let (Some(recorded), Some(actual)) = (recorded, read_mode(&path)?)
            && recorded.ok() != Some(actual)
        {
            fields.insert("mode".to_string(), Value::from(format!("{actual:o}")));
        }
        Ok(true)
    }
}

impl Creatable for LocalFile {
    fn create(&self, fields: &mut Fields, _context: &ProviderContext<'_>) -> Result<()> {
        let path = path_field(fields)?;
        if path.exists() {
            bail!("{} already exists", path.display());
        }
        Self::write(fields)
    }
}

impl Updatable for LocalFile {
    fn update(
        &self,
        _current: &Fields,
        pending: &mut Fields,
        changed: &[&str],
        _context: &ProviderContext<'_>,
    ) -> Result<()> {
        if changed.is_empty() {
            return Ok(());
        }
        Self::write(pending)
    }
}

impl Deletable for LocalFile {
    fn delete(&self, fields: &Fields, _context: &ProviderContext<'_>) -> Result<()> {
        let path = path_field(fields)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(anyhow!(error).context(format!("failed to remove {}", path.display()))),
        }
    }
}

fn parse_mode(mode: &str) -> Result<u32> {
    u32::from_str_radix(mode, 8)
        .ok()
        .filter(|bits| *bits <= 0o7777)
        .ok_or_else(|| anyhow!("mode must be an octal string such as '644', got '{mode}'"))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to set mode of {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn read_mode(path: &Path) -> Result<Option<u32>> {
    use std::os::unix::fs::PermissionsExt;

    let metadata =
        fs::metadata(path).with_context(|| format!("failed to inspect {}", path.display()))?;
    Ok(Some(metadata.permissions().mode() & 0o7777))
}

#[cfg(not(unix))]
fn read_mode(_path: &Path) -> Result<Option<u32>> {
    Ok(None)
}

// ── local::symlink ──────────────────────────────────────────────────

#[derive(Debug)]
pub struct LocalSymlink {
    type_name: TypeName,
    schema: ResourceSchema,
}

impl LocalSymlink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            type_name: TypeName::from_static("local", "symlink"),
            schema: ResourceSchema::new(vec![
                FieldSpec::new("path").id(),
                FieldSpec::new("target").required(),
            ]),
        }
    }
}

impl Default for LocalSymlink {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceType for LocalSymlink {
    fn type_name(&self) -> &TypeName {
        &self.type_name
    }

    fn schema(&self) -> &ResourceSchema {
        &self.schema
    }

    fn refreshable(&self) -> Option<&dyn Refreshable> {
        Some(self)
    }

    fn creatable(&self) -> Option<&dyn Creatable> {
        Some(self)
    }

    fn deletable(&self) -> Option<&dyn Deletable> {
        Some(self)
    }
}

impl Refreshable for LocalSymlink {
    fn refresh(&self, fields: &mut Fields, _context: &ProviderContext<'_>) -> Result<bool> {
        let path = path_field(fields)?;
        let exists = path_exists_including_dangling_symlink(&path)
            .with_context(|| format!("failed to inspect {}", path.display()))?;
        if !exists {
            return Ok(false);
        }
        let metadata = fs::symlink_metadata(&path)
            .with_context(|| format!("failed to inspect {}", path.display()))?;
        if !metadata.file_type().is_symlink() {
            bail!("{} exists but is not a symlink", path.display());
        }

        let target = PathBuf::from(string_field(fields, "target")?);
        let points_to_target = symlink_points_to(&path, &target)
            .with_context(|| format!("failed to read symlink {}", path.display()))?;
        if !points_to_target {
            let actual = fs::read_link(&path)
                .with_context(|| format!("failed to read symlink {}", path.display()))?;
            fields.insert(
                "target".to_string(),
                Value::from(actual.display().to_string()),
            );
        }
        Ok(true)
    }
}

impl Creatable for LocalSymlink {
    fn create(&self, fields: &mut Fields, _context: &ProviderContext<'_>) -> Result<()> {
        let path = path_field(fields)?;
        let target = PathBuf::from(string_field(fields, "target")?);
        let occupied = path_exists_including_dangling_symlink(&path)
            .with_context(|| format!("failed to inspect {}", path.display()))?;
        if occupied {
            bail!("{} already exists", path.display());
        }
        ensure_parent(&path)?;
        create_symlink(&target, &path)
    }
}

impl Deletable for LocalSymlink {
    fn delete(&self, fields: &Fields, _context: &ProviderContext<'_>) -> Result<()> {
        let path = path_field(fields)?;
        let exists = path_exists_including_dangling_symlink(&path)
            .with_context(|| format!("failed to inspect {}", path.display()))?;
        if !exists {
            return Ok(());
        }
        if !fs::symlink_metadata(&path)?.file_type().is_symlink() {
            bail!("refusing to remove {}: not a symlink", path.display());
        }
        fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))
    }
}

fn create_symlink(target: &Path, path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, path).with_context(|| {
            format!(
                "failed to create symlink {} -> {}",
                path.display(),
                target.display()
            )
        })?;
    }

    #[cfg(windows)]
    {
        let result = if target.is_dir() {
            std::os::windows::fs::symlink_dir(target, path)
        } else {
            std::os::windows::fs::symlink_file(target, path)
        };
        result.with_context(|| {
            format!(
                "failed to create symlink {} -> {}. Hint: enable Developer Mode or run an elevated shell",
                path.display(),
                target.display()
            )
        })?;
    }

    Ok(())
}
