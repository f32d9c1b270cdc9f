use std::path::{Component, Path, PathBuf};

/// Short, viewer-facing rendering of a working directory.
///
/// Inside a workspace folder the path is shown relative to it; the folder itself shows its name;
/// anything else shows its final segment only.
pub fn cwd_label(cwd: &Path, folders: &[PathBuf]) -> String {
    for folder in folders {
        if cwd == folder.as_path() {
            return final_segment(folder);
        }
        if let Ok(relative) = cwd.strip_prefix(folder) {
            let parts: Vec<String> = relative
                .components()
                .filter_map(|component| match component {
                    Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect();
            if !parts.is_empty() {
                return parts.join("/");
            }
        }
    }
    final_segment(cwd)
}

fn final_segment(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
