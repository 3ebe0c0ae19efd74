use super::{Diagnosis, DiagnosisError, RemedialAction};
use serde::Deserialize;

/// Strip markdown code fences from a response.
///
/// Only backends that are known to wrap JSON in fences call this; the parser itself
/// takes the answer as-is.
pub(crate) fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if trimmed.starts_with("```json") {
        trimmed.strip_prefix("```json").unwrap_or(trimmed)
    } else if trimmed.starts_with("```") {
        trimmed.strip_prefix("```").unwrap_or(trimmed)
    } else {
        trimmed
    };
    let clean = if clean.ends_with("```") {
        clean.strip_suffix("```").unwrap_or(clean)
    } else {
        clean
    };
    clean.trim()
}

#[derive(Deserialize)]
struct DiagnosisJson {
    matcher: String,
    test_ok: Vec<String>,
    test_fail: Vec<String>,
    packages: Option<Vec<PackageJson>>,
    install_commands: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct PackageJson {
    name: String,
    #[serde(default)]
    manager: String,
}

/// Parse a backend's answer into a [`Diagnosis`].
///
/// `matcher`, `test_ok` and `test_fail` must be present, and at least one of `packages`
/// or `install_commands`. Anything else is an error; a partial diagnosis is never
/// returned.
///
/// Both remedy shapes normalise to [`RemedialAction`]s. A non-empty `packages` list wins;
/// `install_commands` is only used when there are no packages, so one dependency is
/// never installed twice.
pub fn parse_diagnosis(text: &str) -> Result<Diagnosis, DiagnosisError> {
    let parse_error = |message: String| DiagnosisError::Parse {
        message,
        response: text.to_string(),
    };

    let parsed: DiagnosisJson =
        serde_json::from_str(text.trim()).map_err(|e| parse_error(e.to_string()))?;

    if parsed.packages.is_none() && parsed.install_commands.is_none() {
        return Err(parse_error(
            "missing field `packages` or `install_commands`".to_string(),
        ));
    }

    let packages: Vec<RemedialAction> = parsed
        .packages
        .unwrap_or_default()
        .into_iter()
        .filter(|p| !p.name.trim().is_empty())
        .map(|p| RemedialAction::Package {
            manager: p.manager.trim().to_string(),
            name: p.name.trim().to_string(),
        })
        .collect();

    let remedies = if !packages.is_empty() {
        packages
    } else {
        parsed
            .install_commands
            .unwrap_or_default()
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .map(|command| RemedialAction::Shell { command })
            .collect()
    };

    Ok(Diagnosis {
        matcher: parsed.matcher,
        positive_examples: parsed.test_ok,
        negative_examples: parsed.test_fail,
        remedies,
    })
}
