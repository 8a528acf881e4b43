//! The turtle file: a tiny plain-text `key\nvalue\n` bootstrap file naming
//! the metadata tree's checkpoint. It is always rewritten whole, to a
//! temporary file renamed over the original, so a crash leaves either the
//! old or the new version.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const TURTLE_FILE: &str = "turtle";
const TURTLE_TMP: &str = "turtle.set";

pub const KEY_VERSION: &str = "version";
pub const KEY_META_CHECKPOINT: &str = "meta-checkpoint";
pub const KEY_CHECKPOINT_LSN: &str = "checkpoint-lsn";

pub struct Turtle {
    path: PathBuf,
    tmp: PathBuf,
    entries: BTreeMap<String, String>,
}

impl Turtle {
    pub fn load(home: &Path) -> Result<Turtle> {
        let path = home.join(TURTLE_FILE);
        let mut entries = BTreeMap::new();
        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let mut lines = text.lines();
            while let Some(key) = lines.next() {
                let value = lines.next().ok_or_else(|| {
                    Error::corrupt("turtle", 0, "key without a value line")
                })?;
                entries.insert(key.to_string(), value.to_string());
            }
        }
        Ok(Turtle {
            tmp: home.join(TURTLE_TMP),
            path,
            entries,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|s| s.as_str())
    }

    pub fn set(&mut self, key: &str, value: String) {
        debug_assert!(!key.contains('\n') && !value.contains('\n'));
        self.entries.insert(key.to_string(), value);
    }

    /// Persist: write the whole file to a temporary, sync, rename.
    pub fn store(&self) -> Result<()> {
        let mut file = std::fs::File::create(&self.tmp)?;
        for (key, value) in &self.entries {
            writeln!(file, "{key}")?;
            writeln!(file, "{value}")?;
        }
        file.sync_all()?;
        drop(file);
        std::fs::rename(&self.tmp, &self.path)?;
        Ok(())
    }

    /// Hex is the value encoding for binary payloads (cookies, descriptors).
    pub fn encode_bytes(bytes: &[u8]) -> String {
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }

    pub fn decode_bytes(text: &str) -> Result<Vec<u8>> {
        if text.len() % 2 != 0 {
            return Err(Error::corrupt("turtle", 0, "odd-length hex value"));
        }
        (0..text.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&text[i..i + 2], 16)
                    .map_err(|_| Error::corrupt("turtle", 0, "bad hex value"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_rename() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = Turtle::load(dir.path()).unwrap();
        assert!(t.get(KEY_VERSION).is_none());
        t.set(KEY_VERSION, "burrowdb 0.1".into());
        t.set(KEY_META_CHECKPOINT, Turtle::encode_bytes(&[1, 2, 0xAB]));
        t.store().unwrap();

        let t2 = Turtle::load(dir.path()).unwrap();
        assert_eq!(t2.get(KEY_VERSION), Some("burrowdb 0.1"));
        assert_eq!(
            Turtle::decode_bytes(t2.get(KEY_META_CHECKPOINT).unwrap()).unwrap(),
            vec![1, 2, 0xAB]
        );
        // No temporary left behind.
        assert!(!dir.path().join(TURTLE_TMP).exists());
    }

    #[test]
    fn hex_rejects_junk() {
        assert!(Turtle::decode_bytes("abc").is_err());
        assert!(Turtle::decode_bytes("zz").is_err());
        assert_eq!(Turtle::decode_bytes("").unwrap(), Vec::<u8>::new());
    }
}
