use std::sync::LazyLock;

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    let sha = option_env!("VERGEN_GIT_SHA").unwrap_or("unknown");
    let dirty = option_env!("VERGEN_GIT_DIRTY") == Some("true");
    format_version(env!("IMAGE_VERSION"), sha, dirty)
});

fn format_version(image_version: &str, sha: &str, dirty: bool) -> String {
    let short_sha = sha.get(..7).unwrap_or(sha);
    format!(
        "{image_version}-{short_sha}{}",
        if dirty { "-dirty" } else { "" }
    )
}
