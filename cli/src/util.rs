use chrono::NaiveDate;
use serde::Serialize;
use serde_json::json;

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}

fn render(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

pub fn exit_error(message: &str, docs_hint: Option<&str>) -> ! {
    let mut err = json!({
        "error": "cli_error",
        "message": message
    });
    if let Some(hint) = docs_hint {
        err["docs_hint"] = json!(hint);
    }
    eprintln!("{}", render(&err));
    std::process::exit(1);
}

/// Print any serializable value as pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> i32 {
    match serde_json::to_value(value) {
        Ok(v) => {
            println!("{}", render(&v));
            0
        }
        Err(e) => exit_error(&format!("Failed to serialize output: {e}"), None),
    }
}

/// Parse a compact `YYYYMMDD` day.
pub fn parse_day(raw: &str) -> Result<NaiveDate, String> {
    if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("'{raw}' is not a YYYYMMDD date"));
    }
    NaiveDate::parse_from_str(raw, "%Y%m%d").map_err(|e| format!("'{raw}' is not a valid date: {e}"))
}

/// Read a text file, or stdin when path is "-".
pub fn read_text(path: &str) -> Result<String, String> {
    if path == "-" {
        std::io::read_to_string(std::io::stdin()).map_err(|e| format!("Failed to read stdin: {e}"))
    } else {
        std::fs::read_to_string(path).map_err(|e| format!("Failed to read file '{path}': {e}"))
    }
}

/// Execute an API request, print the response, exit with structured code.
///
/// Exit codes: 0=success (2xx), 1=client error (4xx), 2=server error (5xx),
///             3=connection error, 4=usage error
pub async fn api_request(api_url: &str, method: reqwest::Method, path: &str) -> i32 {
    let url = match reqwest::Url::parse(&format!("{}{path}", api_url.trim_end_matches('/'))) {
        Ok(u) => u,
        Err(e) => {
            let err = json!({
                "error": "cli_error",
                "message": format!("Invalid URL: {api_url}{path}: {e}")
            });
            eprintln!("{}", render(&err));
            return 4;
        }
    };

    let resp = match client().request(method, url).send().await {
        Ok(r) => r,
        Err(e) => {
            let err = json!({
                "error": "connection_error",
                "message": format!("{e}"),
                "docs_hint": "Is the API server running? Check TASKMINE_API_URL."
            });
            eprintln!("{}", render(&err));
            return 3;
        }
    };

    let status = resp.status().as_u16();
    let exit_code = match status {
        200..=299 => 0,
        400..=499 => 1,
        _ => 2,
    };

    let resp_body: serde_json::Value = match resp.json().await {
        Ok(v) => v,
        Err(e) => json!({"raw_error": format!("Failed to parse response as JSON: {e}")}),
    };

    if exit_code == 0 {
        println!("{}", render(&resp_body));
    } else {
        eprintln!("{}", render(&resp_body));
    }

    exit_code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_days_only() {
        assert_eq!(
            parse_day("20251001"),
            Ok(NaiveDate::from_ymd_opt(2025, 10, 1).unwrap())
        );
        assert!(parse_day("2025-10-01").is_err());
        assert!(parse_day("20251301").is_err());
    }
}
