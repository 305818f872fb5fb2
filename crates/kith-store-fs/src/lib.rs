use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use kith_core::Contact;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

const CONTACT_DIR_PREFIX: &str = "contact_";
const CONTACT_FILE: &str = "contact.json";
const SETTINGS_FILE: &str = "settings.json";
const DEFAULT_DIR_NAME: &str = ".kith";

/// Settings for the Mailgun-compatible HTTP mail transport, persisted
/// as `settings.json` inside the app directory.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MailerSettings {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    pub domain: String,
    pub api_key: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    pub dest_email: String,
}

fn default_api_base() -> String {
    "https://api.mailgun.net/v3".to_string()
}

fn default_from_name() -> String {
    "kith".to_string()
}

/// The app directory, `~/.kith` by default. One subdirectory per
/// contact, each holding a single `contact.json`.
#[derive(Debug, Clone)]
pub struct KithDir {
    root: PathBuf,
}

impl KithDir {
    /// Open (creating if needed) the app directory.
    ///
    /// # Errors
    /// Fails when no home directory can be resolved for the default
    /// location, or the directory cannot be created.
    pub fn open(root: Option<PathBuf>) -> Result<Self> {
        let root = match root {
            Some(path) => path,
            None => dirs::home_dir()
                .ok_or_else(|| anyhow!("could not determine home directory; pass --dir"))?
                .join(DEFAULT_DIR_NAME),
        };
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create app directory {}", root.display()))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn contact_dir(&self, name: &str) -> PathBuf {
        self.root.join(format!("{CONTACT_DIR_PREFIX}{}", sanitize_name(name)))
    }

    fn settings_path(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }

    /// Persist a contact, replacing any existing record for the same
    /// name. Callers that must not regenerate a salt should check
    /// [`Self::load_contact`] first.
    ///
    /// # Errors
    /// Fails on invalid contact fields or filesystem errors.
    pub fn save_contact(&self, contact: &Contact) -> Result<()> {
        contact.validate()?;
        let dir = self.contact_dir(&contact.name);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create contact directory {}", dir.display()))?;
        let path = dir.join(CONTACT_FILE);
        let body = serde_json::to_string_pretty(contact)
            .with_context(|| format!("failed to serialize contact {:?}", contact.name))?;
        fs::write(&path, body)
            .with_context(|| format!("failed to write contact file {}", path.display()))?;
        Ok(())
    }

    /// Load one contact by name, `None` when absent.
    ///
    /// # Errors
    /// Fails on unreadable or malformed contact files.
    pub fn load_contact(&self, name: &str) -> Result<Option<Contact>> {
        let path = self.contact_dir(name).join(CONTACT_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(read_contact_file(&path)?))
    }

    /// Delete a stored contact.
    ///
    /// # Errors
    /// Fails when no such contact is stored.
    pub fn remove_contact(&self, name: &str) -> Result<()> {
        let dir = self.contact_dir(name);
        if !dir.is_dir() {
            bail!("no stored contact named {name:?}");
        }
        fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to remove contact directory {}", dir.display()))
    }

    /// All stored contacts, sorted by name for deterministic output.
    ///
    /// # Errors
    /// Fails on unreadable or malformed contact files; unrelated
    /// entries in the app directory are ignored.
    pub fn load_contacts(&self) -> Result<Vec<Contact>> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("failed to read app directory {}", self.root.display()))?;
        let mut contacts = Vec::new();
        for entry in entries {
            let entry = entry
                .with_context(|| format!("failed to list app directory {}", self.root.display()))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(dir_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !dir_name.starts_with(CONTACT_DIR_PREFIX) {
                continue;
            }
            let file = path.join(CONTACT_FILE);
            if !file.is_file() {
                continue;
            }
            contacts.push(read_contact_file(&file)?);
        }
        contacts.sort_by(|lhs, rhs| lhs.name.cmp(&rhs.name));
        Ok(contacts)
    }

    /// Stored mailer settings, `None` when setup has not run yet.
    ///
    /// # Errors
    /// Fails on unreadable or malformed settings files.
    pub fn load_settings(&self) -> Result<Option<MailerSettings>> {
        let path = self.settings_path();
        if !path.is_file() {
            return Ok(None);
        }
        let body = fs::read_to_string(&path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let settings = serde_json::from_str(&body)
            .with_context(|| format!("malformed settings file {}", path.display()))?;
        Ok(Some(settings))
    }

    /// Persist mailer settings. The settings file carries an API key,
    /// so it is also appended to the app directory's `.gitignore` for
    /// users who version the directory.
    ///
    /// # Errors
    /// Fails on filesystem errors.
    pub fn save_settings(&self, settings: &MailerSettings) -> Result<()> {
        let path = self.settings_path();
        let body = serde_json::to_string_pretty(settings)
            .context("failed to serialize mailer settings")?;
        fs::write(&path, body)
            .with_context(|| format!("failed to write settings file {}", path.display()))?;
        self.append_to_gitignore(SETTINGS_FILE)
    }

    fn append_to_gitignore(&self, line: &str) -> Result<()> {
        let path = self.root.join(".gitignore");
        let existing = fs::read_to_string(&path).unwrap_or_default();
        if existing.lines().any(|present| present.trim() == line) {
            return Ok(());
        }
        let mut body = existing;
        if !body.is_empty() && !body.ends_with('\n') {
            body.push('\n');
        }
        body.push_str(line);
        body.push('\n');
        fs::write(&path, body)
            .with_context(|| format!("failed to update gitignore {}", path.display()))
    }
}

fn read_contact_file(path: &Path) -> Result<Contact> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read contact file {}", path.display()))?;
    let contact: Contact = serde_json::from_str(&body)
        .with_context(|| format!("malformed contact file {}", path.display()))?;
    contact.validate()?;
    Ok(contact)
}

/// Fresh random salt for a new contact: 32 bytes from the OS RNG,
/// hex-encoded. Assigned once and never regenerated afterwards.
#[must_use]
pub fn generate_salt() -> String {
    let mut bytes = [0_u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}
