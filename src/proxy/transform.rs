//! Path rewriting between the gateway's public routes and the upstream API.

/// Map an OpenAI-style path onto the upstream compatibility endpoint:
/// `/v1/chat/completions` becomes `/v1beta/openai/chat/completions`.
///
/// Paths already in upstream shape are stripped first so the prefix is
/// never applied twice.
pub fn rewrite_openai_path(path: &str) -> String {
    let path = path.strip_prefix("/v1beta/openai").unwrap_or(path);
    let path = path.strip_prefix("/v1").unwrap_or(path);
    format!("/v1beta/openai{path}")
}

/// Ensure a native Gemini path addresses a model resource: insert the
/// `models/` segment after `/v1beta/` when it is missing. Clients commonly
/// send `/v1beta/gemini-pro:generateContent` and expect the gateway to fix
/// it up.
pub fn rewrite_gemini_path(path: &str) -> String {
    if path.contains("/models/") {
        return path.to_string();
    }
    match path.strip_prefix("/v1beta/") {
        Some(rest) => format!("/v1beta/models/{rest}"),
        None => path.to_string(),
    }
}
