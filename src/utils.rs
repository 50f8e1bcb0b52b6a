//! Utility functions for file operations and path manipulation

use crate::types::Fingerprint;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Longest path component produced by [`sanitize_component`], in bytes
pub const MAX_COMPONENT_BYTES: usize = 120;

/// Characters that are not allowed in file names on at least one supported platform
const RESERVED_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Device names Windows refuses as file stems, regardless of extension
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Turn an arbitrary title into a single safe path component
///
/// The function is total: every input yields a non-empty component that is valid on
/// Linux, macOS and Windows.
///
/// - reserved characters and control characters become `_`
/// - runs of whitespace collapse to a single space
/// - leading whitespace and trailing dots/spaces are removed
/// - Windows device names (`CON`, `lpt1.txt`, ...) get a trailing `_`
/// - the result is capped at [`MAX_COMPONENT_BYTES`] on a char boundary
/// - an empty result becomes `untitled`
///
/// # Examples
///
/// ```
/// use course_dl::utils::sanitize_component;
///
/// assert_eq!(sanitize_component("Aula 01: Introdução / Parte 1"), "Aula 01_ Introdução _ Parte 1");
/// assert_eq!(sanitize_component("  ...  "), "untitled");
/// assert_eq!(sanitize_component("con"), "con_");
/// ```
#[must_use]
pub fn sanitize_component(input: &str) -> String {
    sanitize_component_within(input, MAX_COMPONENT_BYTES)
}

/// [`sanitize_component`] with a caller-chosen byte cap
///
/// Used when the component will be extended afterwards (a label, a suffix, an
/// extension) and the whole must stay within [`MAX_COMPONENT_BYTES`].
#[must_use]
pub fn sanitize_component_within(input: &str, max_bytes: usize) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        if ch.is_control() || RESERVED_CHARS.contains(&ch) {
            out.push('_');
        } else {
            out.push(ch);
        }
    }

    let mut out = truncate_on_char_boundary(&out, max_bytes)
        .trim_end_matches(['.', ' '])
        .to_string();

    if out.is_empty() {
        return "untitled".to_string();
    }

    let stem = out.split('.').next().unwrap_or_default();
    if RESERVED_NAMES
        .iter()
        .any(|name| name.eq_ignore_ascii_case(stem))
    {
        out.insert(stem.len(), '_');
    }
    out
}

fn truncate_on_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Append a suffix to the file name of `path` (`state.json` + `.bak` = `state.json.bak`)
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let file_name = match path.file_name() {
        Some(n) => n.to_string_lossy().to_string(),
        None => suffix.to_string(),
    };
    path.with_file_name(format!("{file_name}{suffix}"))
}

/// Write `contents` to `path` through a synced temporary sibling and a rename
///
/// Readers observe either the old file or the complete new one.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = with_suffix(path, ".tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// Lowercase hex encoding
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        // Writing to a String cannot fail
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// First 8 hex characters of the SHA-256 of `input`
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    to_hex(&digest[..4])
}

/// Size and SHA-256 of a file on disk
pub fn fingerprint_file(path: &Path) -> std::io::Result<Fingerprint> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok(Fingerprint {
        size,
        sha256: to_hex(&hasher.finalize()),
    })
}

/// Bytes available to unprivileged writers on the filesystem holding `path`
///
/// `statvfs` on Unix, `GetDiskFreeSpaceExW` on Windows; other platforms return
/// [`std::io::ErrorKind::Unsupported`].
pub fn get_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is NUL-terminated and outlives the call; `stat` is only read
        // after statvfs reported success.
        let stat = unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            stat
        };

        // f_frsize is the unit f_bavail is counted in
        #[allow(clippy::unnecessary_cast)]
        Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        let mut available: u64 = 0;
        // SAFETY: `wide` is NUL-terminated; the out pointer refers to a live u64 and the
        // optional totals are passed as null.
        let ok = unsafe {
            GetDiskFreeSpaceExW(
                wide.as_ptr(),
                &mut available as *mut u64 as *mut _,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(available)
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = path;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "free space query is not supported on this platform",
        ))
    }
}
