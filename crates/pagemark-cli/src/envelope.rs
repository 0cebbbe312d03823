use serde::Serialize;

pub(crate) const SCHEMA_VERSION: u64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ErrorCode {
    InvalidParams,
    InvalidUrl,
    ReadFailed,
    ParseFailed,
    PageLoadFailed,
    UnexpectedError,
}

impl ErrorCode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::InvalidParams => "invalid_params",
            Self::InvalidUrl => "invalid_url",
            Self::ReadFailed => "read_failed",
            Self::ParseFailed => "parse_failed",
            Self::PageLoadFailed => "page_load_failed",
            Self::UnexpectedError => "unexpected_error",
        }
    }

    fn hint(self) -> &'static str {
        match self {
            Self::InvalidParams => "Check the command-line arguments (see --help).",
            Self::InvalidUrl => "Pass an absolute URL, e.g. https://example.com/page.",
            Self::ReadFailed => "Check that the input file exists and is readable.",
            Self::ParseFailed => "The input file is not valid JSON of the expected shape.",
            Self::PageLoadFailed => "The page HTML could not be loaded for this URL.",
            Self::UnexpectedError => "Re-run with PAGEMARK_LOG=debug for details.",
        }
    }

    /// Classify an error bubbling out of a command.
    pub(crate) fn classify(e: &anyhow::Error) -> Self {
        if let Some(core) = e.downcast_ref::<pagemark_core::Error>() {
            return match core {
                pagemark_core::Error::InvalidUrl(_) => Self::InvalidUrl,
                pagemark_core::Error::PageLoad(_) | pagemark_core::Error::NotFound(_) => {
                    Self::PageLoadFailed
                }
                pagemark_core::Error::Protocol(_) => Self::ParseFailed,
                _ => Self::UnexpectedError,
            };
        }
        if e.downcast_ref::<std::io::Error>().is_some() {
            return Self::ReadFailed;
        }
        if e.downcast_ref::<serde_json::Error>().is_some() {
            return Self::ParseFailed;
        }
        if e.downcast_ref::<crate::UsageError>().is_some() {
            return Self::InvalidParams;
        }
        Self::UnexpectedError
    }
}

pub(crate) fn add_envelope_fields(payload: &mut serde_json::Value, kind: &str, elapsed_ms: u128) {
    payload["schema_version"] = serde_json::json!(SCHEMA_VERSION);
    payload["kind"] = serde_json::json!(kind);
    payload["elapsed_ms"] = serde_json::json!(elapsed_ms);
    if payload.get("ok").is_none() {
        payload["ok"] = serde_json::json!(true);
    }
}

pub(crate) fn error_obj(code: ErrorCode, message: impl ToString) -> serde_json::Value {
    #[derive(Serialize)]
    struct ErrorObject {
        code: &'static str,
        message: String,
        hint: &'static str,
    }

    let e = ErrorObject {
        code: code.as_str(),
        message: message.to_string(),
        hint: code.hint(),
    };
    match serde_json::to_value(e) {
        Ok(v) => v,
        Err(_) => serde_json::json!({
            "code": code.as_str(),
            "message": message.to_string(),
            "hint": code.hint(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_fields_are_added_without_clobbering_ok() {
        let mut v = serde_json::json!({"ok": false, "x": 1});
        add_envelope_fields(&mut v, "locate", 3);
        assert_eq!(v["schema_version"], 1);
        assert_eq!(v["kind"], "locate");
        assert_eq!(v["ok"], false);
        assert_eq!(v["x"], 1);
    }

    #[test]
    fn classify_maps_error_sources() {
        let io = anyhow::Error::new(std::io::Error::new(std::io::ErrorKind::NotFound, "x"));
        assert_eq!(ErrorCode::classify(&io), ErrorCode::ReadFailed);
        let url = anyhow::Error::new(pagemark_core::Error::InvalidUrl("x".into()));
        assert_eq!(ErrorCode::classify(&url), ErrorCode::InvalidUrl);
        let other = anyhow::anyhow!("boom");
        assert_eq!(ErrorCode::classify(&other), ErrorCode::UnexpectedError);
        let obj = error_obj(ErrorCode::ReadFailed, "missing.html");
        assert_eq!(obj["code"], "read_failed");
    }
}
