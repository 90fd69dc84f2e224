use bytes::{Buf, BufMut};
use std::fmt;
use std::str::FromStr;

use crate::owner::OwnerCache;
use crate::types::FORMAT_NAME;
use crate::{Error, Result};

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Other,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFREG => FileKind::Regular,
            S_IFDIR => FileKind::Directory,
            S_IFLNK => FileKind::Symlink,
            _ => FileKind::Other,
        }
    }
}

/// Per-file metadata keys. The declaration order is also the bit order of the
/// presence mask in the encoded form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileKey {
    Mode,
    MtimeSec,
    MtimeNsec,
    AtimeSec,
    AtimeNsec,
    Nlink,
    Size,
    Uid,
    Gid,
    Dev,
    Ino,
    Blocks,
    Groupname,
    Username,
    SymlinkTarget,
    Checksum,
    XattrBlob,
}

impl FileKey {
    pub const ALL: [FileKey; 17] = [
        FileKey::Mode,
        FileKey::MtimeSec,
        FileKey::MtimeNsec,
        FileKey::AtimeSec,
        FileKey::AtimeNsec,
        FileKey::Nlink,
        FileKey::Size,
        FileKey::Uid,
        FileKey::Gid,
        FileKey::Dev,
        FileKey::Ino,
        FileKey::Blocks,
        FileKey::Groupname,
        FileKey::Username,
        FileKey::SymlinkTarget,
        FileKey::Checksum,
        FileKey::XattrBlob,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FileKey::Mode => "mode",
            FileKey::MtimeSec => "mtime_sec",
            FileKey::MtimeNsec => "mtime_nsec",
            FileKey::AtimeSec => "atime_sec",
            FileKey::AtimeNsec => "atime_nsec",
            FileKey::Nlink => "nlink",
            FileKey::Size => "size",
            FileKey::Uid => "uid",
            FileKey::Gid => "gid",
            FileKey::Dev => "dev",
            FileKey::Ino => "ino",
            FileKey::Blocks => "blocks",
            FileKey::Groupname => "groupname",
            FileKey::Username => "username",
            FileKey::SymlinkTarget => "symlink_target",
            FileKey::Checksum => "checksum",
            FileKey::XattrBlob => "xattr",
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(
            self,
            FileKey::Groupname
                | FileKey::Username
                | FileKey::SymlinkTarget
                | FileKey::Checksum
                | FileKey::XattrBlob
        )
    }

    fn bit(self) -> u64 {
        1 << (self as u64)
    }
}

impl FromStr for FileKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        FileKey::ALL
            .into_iter()
            .find(|key| key.name() == s)
            .ok_or_else(|| Error::KeyNotAllowed {
                format: FORMAT_NAME.to_string(),
                key: s.to_string(),
            })
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bookkeeping keys stored with every generation. All are integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationKey {
    Started,
    Ended,
    IsCheckpoint,
    FileCount,
    TotalData,
}

impl GenerationKey {
    pub const ALL: [GenerationKey; 5] = [
        GenerationKey::Started,
        GenerationKey::Ended,
        GenerationKey::IsCheckpoint,
        GenerationKey::FileCount,
        GenerationKey::TotalData,
    ];

    pub fn name(self) -> &'static str {
        match self {
            GenerationKey::Started => "started",
            GenerationKey::Ended => "ended",
            GenerationKey::IsCheckpoint => "is_checkpoint",
            GenerationKey::FileCount => "file_count",
            GenerationKey::TotalData => "total_data",
        }
    }
}

impl FromStr for GenerationKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        GenerationKey::ALL
            .into_iter()
            .find(|key| key.name() == s)
            .ok_or_else(|| Error::KeyNotAllowed {
                format: FORMAT_NAME.to_string(),
                key: s.to_string(),
            })
    }
}

impl fmt::Display for GenerationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyValue {
    Integer(i64),
    Text(String),
    Blob(Vec<u8>),
}

impl KeyValue {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            KeyValue::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

/// Metadata of one filesystem entry. `None` means "not recorded".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub mode: Option<u32>,
    pub mtime_sec: Option<i64>,
    pub mtime_nsec: Option<u32>,
    pub atime_sec: Option<i64>,
    pub atime_nsec: Option<u32>,
    pub nlink: Option<u64>,
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub dev: Option<u64>,
    pub ino: Option<u64>,
    pub blocks: Option<u64>,
    pub groupname: Option<String>,
    pub username: Option<String>,
    pub target: Option<String>,
    pub checksum: Option<String>,
    pub xattr: Option<Vec<u8>>,
}

impl Metadata {
    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode.unwrap_or(0))
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == FileKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind() == FileKind::Regular
    }

    pub fn is_symlink(&self) -> bool {
        self.kind() == FileKind::Symlink
    }

    fn integer(&self, key: FileKey) -> Option<i64> {
        match key {
            FileKey::Mode => self.mode.map(i64::from),
            FileKey::MtimeSec => self.mtime_sec,
            FileKey::MtimeNsec => self.mtime_nsec.map(i64::from),
            FileKey::AtimeSec => self.atime_sec,
            FileKey::AtimeNsec => self.atime_nsec.map(i64::from),
            FileKey::Nlink => self.nlink.map(|n| n as i64),
            FileKey::Size => self.size.map(|n| n as i64),
            FileKey::Uid => self.uid.map(i64::from),
            FileKey::Gid => self.gid.map(i64::from),
            FileKey::Dev => self.dev.map(|n| n as i64),
            FileKey::Ino => self.ino.map(|n| n as i64),
            FileKey::Blocks => self.blocks.map(|n| n as i64),
            _ => None,
        }
    }

    fn bytes(&self, key: FileKey) -> Option<&[u8]> {
        match key {
            FileKey::Groupname => self.groupname.as_deref().map(str::as_bytes),
            FileKey::Username => self.username.as_deref().map(str::as_bytes),
            FileKey::SymlinkTarget => self.target.as_deref().map(str::as_bytes),
            FileKey::Checksum => self.checksum.as_deref().map(str::as_bytes),
            FileKey::XattrBlob => self.xattr.as_deref(),
            _ => None,
        }
    }

    pub fn is_set(&self, key: FileKey) -> bool {
        if key.is_integer() {
            self.integer(key).is_some()
        } else {
            self.bytes(key).is_some()
        }
    }

    /// Value of `key`, or the type's zero value when unset.
    pub fn get(&self, key: FileKey) -> KeyValue {
        match key {
            FileKey::XattrBlob => KeyValue::Blob(self.xattr.clone().unwrap_or_default()),
            k if k.is_integer() => KeyValue::Integer(self.integer(k).unwrap_or(0)),
            k => KeyValue::Text(
                self.bytes(k)
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default(),
            ),
        }
    }

    /// Set one field. Integers outside the field's range are rejected.
    pub fn set(&mut self, key: FileKey, value: KeyValue) -> Result<()> {
        let invalid = || Error::InvalidKeyValue {
            key: key.name().to_string(),
        };
        let narrow = |n: i64| u32::try_from(n).map_err(|_| invalid());
        let wide = |n: i64| u64::try_from(n).map_err(|_| invalid());
        match (key, value) {
            (FileKey::Mode, KeyValue::Integer(n)) => self.mode = Some(narrow(n)?),
            (FileKey::MtimeSec, KeyValue::Integer(n)) => self.mtime_sec = Some(n),
            (FileKey::MtimeNsec, KeyValue::Integer(n)) => self.mtime_nsec = Some(narrow(n)?),
            (FileKey::AtimeSec, KeyValue::Integer(n)) => self.atime_sec = Some(n),
            (FileKey::AtimeNsec, KeyValue::Integer(n)) => self.atime_nsec = Some(narrow(n)?),
            (FileKey::Nlink, KeyValue::Integer(n)) => self.nlink = Some(wide(n)?),
            (FileKey::Size, KeyValue::Integer(n)) => self.size = Some(wide(n)?),
            (FileKey::Uid, KeyValue::Integer(n)) => self.uid = Some(narrow(n)?),
            (FileKey::Gid, KeyValue::Integer(n)) => self.gid = Some(narrow(n)?),
            (FileKey::Dev, KeyValue::Integer(n)) => self.dev = Some(wide(n)?),
            (FileKey::Ino, KeyValue::Integer(n)) => self.ino = Some(wide(n)?),
            (FileKey::Blocks, KeyValue::Integer(n)) => self.blocks = Some(wide(n)?),
            (FileKey::Groupname, KeyValue::Text(s)) => self.groupname = Some(s),
            (FileKey::Username, KeyValue::Text(s)) => self.username = Some(s),
            (FileKey::SymlinkTarget, KeyValue::Text(s)) => self.target = Some(s),
            (FileKey::Checksum, KeyValue::Text(s)) => self.checksum = Some(s),
            (FileKey::XattrBlob, KeyValue::Blob(b)) => self.xattr = Some(b),
            _ => return Err(invalid()),
        }
        Ok(())
    }

    /// Stored integers are the raw bits of the field, so 64-bit fields above
    /// `i64::MAX` come back negative here.
    fn set_stored_integer(&mut self, key: FileKey, raw: i64) -> Result<()> {
        let bits = raw as u64;
        match key {
            FileKey::Nlink => self.nlink = Some(bits),
            FileKey::Size => self.size = Some(bits),
            FileKey::Dev => self.dev = Some(bits),
            FileKey::Ino => self.ino = Some(bits),
            FileKey::Blocks => self.blocks = Some(bits),
            _ => {
                return self.set(key, KeyValue::Integer(raw)).map_err(|_| {
                    Error::Encoding(format!("metadata field {key} out of range: {raw}"))
                });
            }
        }
        Ok(())
    }

    /// Compact binary form: presence mask, twelve fixed-width big-endian
    /// integers, five lengths, then the variable-length fields.
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u64;
        for key in FileKey::ALL {
            if self.is_set(key) {
                flags |= key.bit();
            }
        }

        let strings: Vec<&[u8]> = FileKey::ALL
            .into_iter()
            .filter(|k| !k.is_integer())
            .map(|k| self.bytes(k).unwrap_or_default())
            .collect();
        let mut buf = Vec::with_capacity(HEADER_LEN + strings.iter().map(|s| s.len()).sum::<usize>());
        buf.put_u64(flags);
        for key in FileKey::ALL.into_iter().filter(|k| k.is_integer()) {
            buf.put_i64(self.integer(key).unwrap_or(0));
        }
        for s in &strings {
            buf.put_u64(s.len() as u64);
        }
        for s in &strings {
            buf.put_slice(s);
        }
        buf
    }

    pub fn decode(mut encoded: &[u8]) -> Result<Self> {
        if encoded.remaining() < HEADER_LEN {
            return Err(Error::Encoding(format!(
                "metadata record too short: {} bytes",
                encoded.len()
            )));
        }
        let flags = encoded.get_u64();
        let present = |key: FileKey| flags & key.bit() != 0;

        let mut metadata = Metadata::default();
        for key in FileKey::ALL.into_iter().filter(|k| k.is_integer()) {
            let value = encoded.get_i64();
            if present(key) {
                metadata.set_stored_integer(key, value)?;
            }
        }

        let text_keys: Vec<FileKey> = FileKey::ALL.into_iter().filter(|k| !k.is_integer()).collect();
        let lengths: Vec<usize> = text_keys.iter().map(|_| encoded.get_u64() as usize).collect();
        for (key, len) in text_keys.into_iter().zip(lengths) {
            if encoded.remaining() < len {
                return Err(Error::Encoding(format!(
                    "metadata field {key} truncated"
                )));
            }
            let raw = encoded[..len].to_vec();
            encoded.advance(len);
            if !present(key) {
                continue;
            }
            let value = if key == FileKey::XattrBlob {
                KeyValue::Blob(raw)
            } else {
                KeyValue::Text(
                    String::from_utf8(raw)
                        .map_err(|e| Error::Encoding(format!("metadata field {key}: {e}")))?,
                )
            };
            metadata.set(key, value)?;
        }
        Ok(metadata)
    }

    /// Read metadata of a local filesystem entry without following symlinks.
    #[cfg(unix)]
    pub fn from_path(path: &std::path::Path, owners: &mut OwnerCache) -> Result<Self> {
        use std::os::unix::fs::MetadataExt;

        let st = std::fs::symlink_metadata(path)?;
        let target = if st.file_type().is_symlink() {
            Some(std::fs::read_link(path)?.to_string_lossy().into_owned())
        } else {
            None
        };
        Ok(Metadata {
            mode: Some(st.mode()),
            mtime_sec: Some(st.mtime()),
            mtime_nsec: Some(st.mtime_nsec() as u32),
            atime_sec: Some(st.atime()),
            atime_nsec: Some(st.atime_nsec() as u32),
            nlink: Some(st.nlink()),
            size: Some(st.size()),
            uid: Some(st.uid()),
            gid: Some(st.gid()),
            dev: Some(st.dev()),
            ino: Some(st.ino()),
            blocks: Some(st.blocks()),
            username: owners.username(st.uid()),
            groupname: owners.groupname(st.gid()),
            target,
            checksum: None,
            xattr: None,
        })
    }
}

const HEADER_LEN: usize = 8 * 18;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Metadata {
        Metadata {
            mode: Some(S_IFREG | 0o644),
            mtime_sec: Some(-5),
            mtime_nsec: Some(999),
            size: Some(3),
            uid: Some(1000),
            username: Some("alice".to_string()),
            checksum: Some("abc".to_string()),
            xattr: Some(vec![0, 1, 2]),
            ..Default::default()
        }
    }

    #[test]
    fn test_codec_preserves_absent_fields() {
        let metadata = sample();
        let decoded = Metadata::decode(&metadata.encode()).unwrap();
        assert_eq!(decoded, metadata);
        assert_eq!(decoded.gid, None);
        assert_eq!(decoded.groupname, None);
    }

    #[test]
    fn test_decode_rejects_truncated_records() {
        let encoded = sample().encode();
        assert!(Metadata::decode(&encoded[..10]).is_err());
        assert!(Metadata::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_get_defaults_and_type_checks() {
        let mut metadata = Metadata::default();
        assert_eq!(metadata.get(FileKey::Size), KeyValue::Integer(0));
        assert_eq!(metadata.get(FileKey::Username), KeyValue::Text(String::new()));
        assert!(metadata.set(FileKey::Size, KeyValue::Text("x".into())).is_err());
        metadata.set(FileKey::Mode, KeyValue::Integer((S_IFDIR | 0o755) as i64)).unwrap();
        assert!(metadata.is_dir());
    }

    #[test]
    fn test_set_rejects_out_of_range_integers() {
        let mut metadata = Metadata::default();
        for (key, value) in [
            (FileKey::Uid, -1),
            (FileKey::Gid, 1 << 40),
            (FileKey::Mode, i64::from(u32::MAX) + 1),
            (FileKey::MtimeNsec, -7),
            (FileKey::Size, -1),
        ] {
            assert!(
                matches!(
                    metadata.set(key, KeyValue::Integer(value)),
                    Err(Error::InvalidKeyValue { .. })
                ),
                "{key} accepted {value}"
            );
        }
        assert_eq!(metadata, Metadata::default());

        metadata.set(FileKey::Uid, KeyValue::Integer(i64::from(u32::MAX))).unwrap();
        assert_eq!(metadata.uid, Some(u32::MAX));
    }

    #[test]
    fn test_codec_keeps_full_width_inodes() {
        let metadata = Metadata {
            ino: Some(u64::MAX - 1),
            dev: Some(1 << 63),
            ..Default::default()
        };
        assert_eq!(Metadata::decode(&metadata.encode()).unwrap(), metadata);
    }

    #[test]
    fn test_key_names_parse() {
        assert_eq!("mtime_sec".parse::<FileKey>().unwrap(), FileKey::MtimeSec);
        assert_eq!("ended".parse::<GenerationKey>().unwrap(), GenerationKey::Ended);
        assert!(matches!(
            "colour".parse::<FileKey>(),
            Err(Error::KeyNotAllowed { .. })
        ));
    }

    #[test]
    fn test_file_kind_from_mode() {
        assert_eq!(FileKind::from_mode(S_IFLNK | 0o777), FileKind::Symlink);
        assert_eq!(FileKind::from_mode(0o020644), FileKind::Other);
    }
}
