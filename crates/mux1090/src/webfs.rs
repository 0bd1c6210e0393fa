/*!
 * The filesystem behind the HTTP static file routes.
 *
 * Two implementations of one capability: files on disk under the
 * configured web root, or an in-memory packed set with a sorted lookup
 * table. The server picks one at startup and never mixes them.
 */
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

pub struct FileContent {
    pub bytes: Vec<u8>,
    pub mtime: SystemTime,
}

pub trait WebFs: Send + Sync {
    /// Enumerate the known file names
    fn list(&self) -> Vec<String>;
    /// Fetch a file by its name relative to the root
    fn open(&self, name: &str) -> Option<FileContent>;
    /// Size and modification time without fetching the content
    fn stat(&self, name: &str) -> Option<(u64, SystemTime)>;
}

/// Files on disk, rooted at the web root directory
pub struct DiskFs {
    root: PathBuf,
}

impl DiskFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DiskFs { root: root.into() }
    }

    /// Only plain relative paths are resolved under the root
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(relative))
    }
}

impl WebFs for DiskFs {
    fn list(&self) -> Vec<String> {
        fs::read_dir(&self.root)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().is_file())
                    .filter_map(|e| e.file_name().into_string().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn open(&self, name: &str) -> Option<FileContent> {
        let path = self.resolve(name)?;
        let meta = fs::metadata(&path).ok()?;
        if !meta.is_file() {
            return None;
        }
        Some(FileContent {
            bytes: fs::read(&path).ok()?,
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        })
    }

    fn stat(&self, name: &str) -> Option<(u64, SystemTime)> {
        let path = self.resolve(name)?;
        let meta = fs::metadata(&path).ok()?;
        if !meta.is_file() {
            return None;
        }
        Some((
            meta.len(),
            meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        ))
    }
}

/// In-memory files with a name-sorted lookup table
pub struct PackedFs {
    entries: Vec<(String, Vec<u8>)>,
    mtime: SystemTime,
}

impl PackedFs {
    pub fn new(mut entries: Vec<(String, Vec<u8>)>) -> Self {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        PackedFs {
            entries,
            mtime: SystemTime::now(),
        }
    }

    /// The built-in page, enough for a sanity check against a browser
    pub fn builtin() -> Self {
        let index = concat!(
            "<!DOCTYPE html>\n<html>\n<head><title>mux1090</title></head>\n",
            "<body>\n<h1>mux1090</h1>\n",
            "<p>Aircraft data is at <a href=\"data/aircraft.json\">",
            "data/aircraft.json</a>.</p>\n</body>\n</html>\n"
        );
        PackedFs::new(vec![(
            "index.html".to_string(),
            index.as_bytes().to_vec(),
        )])
    }

    fn find(&self, name: &str) -> Option<&(String, Vec<u8>)> {
        let name = name.trim_start_matches('/');
        self.entries
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
            .ok()
            .map(|i| &self.entries[i])
    }
}

impl WebFs for PackedFs {
    fn list(&self) -> Vec<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }

    fn open(&self, name: &str) -> Option<FileContent> {
        self.find(name).map(|(_, bytes)| FileContent {
            bytes: bytes.clone(),
            mtime: self.mtime,
        })
    }

    fn stat(&self, name: &str) -> Option<(u64, SystemTime)> {
        self.find(name)
            .map(|(_, bytes)| (bytes.len() as u64, self.mtime))
    }
}

/// Content type by file extension, text/plain otherwise
pub fn content_type(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("html") | Some("htm") => "text/html",
        Some("js") => "application/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        Some("svg") => "image/svg+xml",
        Some("gif") => "image/gif",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "text/plain",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_lookup_is_by_name() {
        let packed = PackedFs::new(vec![
            ("zz.js".to_string(), b"var x;".to_vec()),
            ("index.html".to_string(), b"<html>".to_vec()),
        ]);
        assert_eq!(packed.list(), vec!["index.html", "zz.js"]);
        assert_eq!(packed.open("zz.js").unwrap().bytes, b"var x;");
        assert_eq!(packed.stat("index.html").unwrap().0, 6);
        assert!(packed.open("nope.css").is_none());
    }

    #[test]
    fn disk_refuses_path_escapes() {
        let disk = DiskFs::new("/tmp/webroot");
        assert!(disk.resolve("../etc/passwd").is_none());
        assert!(disk.resolve("style/../../../etc/passwd").is_none());
        assert!(disk.resolve("style/app.css").is_some());
    }
}
