//! The account whose data is being backed up or restored.

/// Identity of the signed-in account
pub trait CurrentAccount: Send + Sync {
    /// Stable account identifier, recorded in backup metadata
    fn id(&self) -> &str;

    /// Display handle, used to name backup files
    fn handle(&self) -> &str;
}

/// Plain-data [`CurrentAccount`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub id: String,
    pub handle: String,
}

impl AccountInfo {
    pub fn new(id: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handle: handle.into(),
        }
    }
}

impl CurrentAccount for AccountInfo {
    fn id(&self) -> &str {
        &self.id
    }

    fn handle(&self) -> &str {
        &self.handle
    }
}

/// File name for a backup of `handle`: `<handle>_backup.<extension>`.
///
/// Characters that are unsafe in file names become `_`.
pub fn backup_file_name(handle: &str, extension: &str) -> String {
    let sanitized: String = handle
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let sanitized = sanitized.trim_start_matches('.');
    let stem = if sanitized.is_empty() {
        "account"
    } else {
        sanitized
    };
    format!("{}_backup.{}", stem, extension)
}
