//! Ollama HTTP backend

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::backend::{BackendError, CompletionBackend, Result};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:11434";
pub const DEFAULT_MODEL: &str = "codellama:7b";

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Talks to a local Ollama server through `/api/generate`.
pub struct OllamaBackend {
    endpoint: String,
    model: String,
    agent: ureq::Agent,
}

impl OllamaBackend {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();

        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            agent,
        }
    }

    fn generate(&self, prompt: String) -> Result<String> {
        let url = format!("{}/api/generate", self.endpoint);
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        };

        let response = match self.agent.post(&url).send_json(&body) {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => return Err(BackendError::Status(code)),
            Err(e) => return Err(BackendError::Transport(e.to_string())),
        };

        let parsed: GenerateResponse = response
            .into_json()
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        debug!("ollama answered {} bytes", parsed.response.len());
        Ok(parsed.response)
    }
}

impl CompletionBackend for OllamaBackend {
    fn complete(&self, partial: &str, language: &str, context: &str) -> Result<Option<String>> {
        let answer = self.generate(completion_prompt(partial, language, context))?;
        Ok(normalize_completion(&answer, partial))
    }

    fn explain(&self, command: &str, output: &str) -> Result<Option<String>> {
        let answer = self.generate(explain_prompt(command, output))?;
        Ok(normalize_explanation(&answer))
    }
}

fn completion_prompt(partial: &str, language: &str, context: &str) -> String {
    let mut prompt = format!(
        "Complete this {language} command line. Reply with the single completed \
         command only, no explanation and no markdown.\n"
    );
    if !context.trim().is_empty() {
        prompt.push_str("\nRecent terminal output:\n");
        prompt.push_str(context);
        prompt.push('\n');
    }
    prompt.push_str("\nCommand: ");
    prompt.push_str(partial);
    prompt
}

fn explain_prompt(command: &str, output: &str) -> String {
    format!(
        "The shell command `{command}` produced this output:\n{output}\n\n\
         In one short sentence, explain what went wrong and how to fix it."
    )
}

/// First meaningful line of a model answer, with markdown fences, inline
/// backticks and a leading shell prompt removed.
fn first_line(answer: &str) -> Option<String> {
    answer
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("```"))
        .map(|line| line.trim_matches('`').trim())
        .map(|line| line.strip_prefix("$ ").unwrap_or(line).trim())
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

fn normalize_completion(answer: &str, partial: &str) -> Option<String> {
    let line = first_line(answer)?;
    // Echoing the input back is not a suggestion
    if line == partial.trim() {
        return None;
    }
    Some(line)
}

fn normalize_explanation(answer: &str) -> Option<String> {
    let text = answer.trim();
    if text.is_empty() {
        return None;
    }
    Some(text.split_whitespace().collect::<Vec<_>>().join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serve one HTTP request with a canned response and hand back the
    /// request that was received.
    fn serve_once(status: &str, body: &str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let reply = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= split + 4 + length {
                        break;
                    }
                }
            }
            stream.write_all(reply.as_bytes()).unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (endpoint, handle)
    }

    #[test]
    fn completes_through_generate_api() {
        let (endpoint, server) = serve_once("200 OK", r#"{"response":"```bash\nls -la\n```"}"#);
        let backend = OllamaBackend::new(endpoint, "codellama:7b", Duration::from_secs(5));

        let answer = backend.complete("ls", "bash", "").unwrap();
        assert_eq!(answer.as_deref(), Some("ls -la"));

        let request = server.join().unwrap();
        assert!(request.starts_with("POST /api/generate"));
        assert!(request.contains(r#""model":"codellama:7b""#));
        assert!(request.contains(r#""stream":false"#));
    }

    #[test]
    fn http_error_is_reported() {
        let (endpoint, server) = serve_once("500 Internal Server Error", "{}");
        let backend = OllamaBackend::new(endpoint, "m", Duration::from_secs(5));
        let err = backend.complete("ls", "bash", "").unwrap_err();
        assert!(matches!(err, BackendError::Status(500)));
        server.join().unwrap();
    }

    #[test]
    fn non_json_body_is_malformed() {
        let (endpoint, server) = serve_once("200 OK", "not json");
        let backend = OllamaBackend::new(endpoint, "m", Duration::from_secs(5));
        let err = backend.explain("make", "error").unwrap_err();
        assert!(matches!(err, BackendError::Malformed(_)));
        server.join().unwrap();
    }

    #[test]
    fn unreachable_server_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let backend = OllamaBackend::new(endpoint, "m", Duration::from_millis(500));
        let err = backend.complete("ls", "bash", "").unwrap_err();
        assert!(matches!(err, BackendError::Transport(_)));
    }

    #[test]
    fn normalizes_answers() {
        assert_eq!(normalize_completion("`git status`", "git st"), Some("git status".into()));
        assert_eq!(normalize_completion("$ docker ps -a\n", "docker"), Some("docker ps -a".into()));
        assert_eq!(normalize_completion("\n\n  npm install \nnote", "npm"), Some("npm install".into()));
        assert_eq!(normalize_completion("```\n```", "ls"), None);
        assert_eq!(normalize_completion("   ", "ls"), None);
        assert_eq!(normalize_completion("ls", "ls"), None);
        assert_eq!(
            normalize_explanation("  The file\n does not exist. "),
            Some("The file does not exist.".into())
        );
        assert_eq!(normalize_explanation("\n"), None);
    }

    #[test]
    fn prompt_includes_context_only_when_present() {
        assert!(!completion_prompt("ls", "bash", "").contains("Recent terminal output"));
        let prompt = completion_prompt("pip ins", "python", "Collecting x");
        assert!(prompt.contains("python command"));
        assert!(prompt.contains("Collecting x"));
        assert!(prompt.ends_with("Command: pip ins"));
    }
}
