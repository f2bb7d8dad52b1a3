//! File-type policy: which sandbox outputs are transferable and how they are
//! served. The table is deliberately finite; anything outside it downloads
//! as an opaque byte stream and never enters the registry.

/// Extensions the registry will transfer out of a sandbox.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "txt", "json", "py", "js", "ts", "html", "css", "md", "yml", "yaml", "xml", "csv", "sql",
    "sh", "env",
];

pub fn extension(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn is_allowed(name: &str) -> bool {
    extension(name)
        .map(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Content type served for a file name. Unknown extensions fall back to the
/// opaque default rather than guessing.
pub fn content_type(name: &str) -> &'static str {
    let Some(ext) = extension(name) else {
        return "application/octet-stream";
    };
    match ext.as_str() {
        "txt" | "env" => "text/plain",
        "json" => "application/json",
        "py" => "text/x-python",
        "js" => "application/javascript",
        "ts" => "application/typescript",
        "html" => "text/html",
        "css" => "text/css",
        "md" => "text/markdown",
        "yml" | "yaml" => "text/yaml",
        "xml" => "application/xml",
        "csv" => "text/csv",
        "sql" => "application/sql",
        "sh" => "application/x-sh",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_extensions_map_to_types() {
        assert_eq!(content_type("report.md"), "text/markdown");
        assert_eq!(content_type("data.json"), "application/json");
        assert_eq!(content_type("script.py"), "text/x-python");
        assert_eq!(content_type("config.yml"), "text/yaml");
        assert_eq!(content_type("vars.env"), "text/plain");
    }

    #[test]
    fn unknown_extension_falls_back_to_octet_stream() {
        assert_eq!(content_type("binary.exe"), "application/octet-stream");
        assert_eq!(content_type("archive.tar.gz"), "application/octet-stream");
        assert_eq!(content_type("no_extension"), "application/octet-stream");
    }

    #[test]
    fn extension_matching_is_case_insensitive() {
        assert_eq!(content_type("README.MD"), "text/markdown");
        assert!(is_allowed("NOTES.TXT"));
    }

    #[test]
    fn allow_list_excludes_binaries_and_dotfiles() {
        assert!(is_allowed("main.py"));
        assert!(is_allowed("data.csv"));
        assert!(!is_allowed("image.png"));
        assert!(!is_allowed("binary.exe"));
        assert!(!is_allowed(".gitignore"));
        assert!(!is_allowed("Makefile"));
    }
}
