//! Recognizing login progress in raw terminal output.

use regex::Regex;

/// Which step of the login the output belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginPhase {
    /// Waiting for the CLI to print the authorization URL.
    AwaitingUrl,
    /// Redirect URL submitted, waiting for the CLI to finish.
    AwaitingCompletion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchEvent {
    AuthUrl(String),
    Completed,
    Failed,
}

/// Scans the accumulated output of a login process.
pub trait OutputMatcher: Send + Sync {
    /// `output` is everything captured since the phase began.
    fn scan(&self, phase: LoginPhase, output: &str) -> Option<MatchEvent>;
}

/// Matches the agent CLI's `models auth login` output.
pub struct DefaultLoginMatcher {
    auth_url: Regex,
    paste_prompt: Regex,
    bare_url: Regex,
    failure: Regex,
    success: Regex,
}

impl DefaultLoginMatcher {
    pub fn new() -> Self {
        Self {
            auth_url: Regex::new(r"Auth URL:\s*(https?://\S+)").expect("valid regex"),
            paste_prompt: Regex::new(r"(?i)paste\s+(?:the\s+)?(?:full\s+)?redirect\s+url")
                .expect("valid regex"),
            bare_url: Regex::new(r"^https?://\S+$").expect("valid regex"),
            // Failure words are checked before success words and are
            // case-sensitive: "Error" as a label, not "error" inside a URL.
            failure: Regex::new(r"Error|mismatch|failed").expect("valid regex"),
            success: Regex::new(r"Auth profile:|complete").expect("valid regex"),
        }
    }

    fn find_url(&self, output: &str) -> Option<String> {
        if let Some(caps) = self.auth_url.captures(output) {
            return Some(caps[1].to_string());
        }

        let prompt = self.paste_prompt.find(output)?;
        output[..prompt.start()]
            .lines()
            .map(str::trim)
            .rev()
            .find(|line| self.bare_url.is_match(line))
            .map(str::to_string)
    }
}

impl Default for DefaultLoginMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputMatcher for DefaultLoginMatcher {
    fn scan(&self, phase: LoginPhase, output: &str) -> Option<MatchEvent> {
        let clean = strip_ansi(output);
        match phase {
            LoginPhase::AwaitingUrl => self.find_url(&clean).map(MatchEvent::AuthUrl),
            LoginPhase::AwaitingCompletion => {
                if self.failure.is_match(&clean) {
                    Some(MatchEvent::Failed)
                } else if self.success.is_match(&clean) {
                    Some(MatchEvent::Completed)
                } else {
                    None
                }
            }
        }
    }
}

/// Remove terminal escape sequences and carriage returns.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\u{1b}' => match chars.peek() {
                // CSI: ESC [ params... final byte in @..~
                Some('[') => {
                    chars.next();
                    for c in chars.by_ref() {
                        if ('@'..='~').contains(&c) {
                            break;
                        }
                    }
                }
                // OSC: ESC ] ... BEL or ESC \
                Some(']') => {
                    chars.next();
                    while let Some(c) = chars.next() {
                        if c == '\u{7}' {
                            break;
                        }
                        if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                Some(_) => {
                    chars.next();
                }
                None => {}
            },
            '\r' => {}
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(phase: LoginPhase, output: &str) -> Option<MatchEvent> {
        DefaultLoginMatcher::new().scan(phase, output)
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(
            strip_ansi("\u{1b}[1;32mAuth URL:\u{1b}[0m https://x\r\n"),
            "Auth URL: https://x\n"
        );
        assert_eq!(strip_ansi("\u{1b}]0;title\u{7}ok"), "ok");
    }

    #[test]
    fn test_labelled_auth_url() {
        let out = "Starting login...\r\n\u{1b}[36mAuth URL:\u{1b}[0m https://auth.openai.com/oauth/authorize?client_id=abc&state=xyz\r\n";
        assert_eq!(
            scan(LoginPhase::AwaitingUrl, out),
            Some(MatchEvent::AuthUrl(
                "https://auth.openai.com/oauth/authorize?client_id=abc&state=xyz".into()
            ))
        );
    }

    #[test]
    fn test_bare_url_before_paste_prompt() {
        let out = "Open this URL in your browser:\n\nhttps://claude.ai/oauth/authorize?code=true\n\n? Paste the redirect URL here: ";
        assert_eq!(
            scan(LoginPhase::AwaitingUrl, out),
            Some(MatchEvent::AuthUrl("https://claude.ai/oauth/authorize?code=true".into()))
        );
    }

    #[test]
    fn test_bare_url_without_prompt_is_not_enough() {
        let out = "Docs: \nhttps://docs.example.com/login\n";
        assert_eq!(scan(LoginPhase::AwaitingUrl, out), None);
    }

    #[test]
    fn test_completion_phase() {
        assert_eq!(
            scan(LoginPhase::AwaitingCompletion, "Auth profile: openai-codex:default"),
            Some(MatchEvent::Completed)
        );
        assert_eq!(
            scan(LoginPhase::AwaitingCompletion, "Login complete."),
            Some(MatchEvent::Completed)
        );
        assert_eq!(
            scan(LoginPhase::AwaitingCompletion, "OAuth state mismatch"),
            Some(MatchEvent::Failed)
        );
        assert_eq!(scan(LoginPhase::AwaitingCompletion, "Exchanging code..."), None);
    }

    #[test]
    fn test_failure_checked_before_success() {
        assert_eq!(
            scan(
                LoginPhase::AwaitingCompletion,
                "Token exchange failed; login not complete"
            ),
            Some(MatchEvent::Failed)
        );
    }

    #[test]
    fn test_phases_do_not_cross_match() {
        assert_eq!(scan(LoginPhase::AwaitingUrl, "Auth profile: x:default"), None);
        assert_eq!(
            scan(LoginPhase::AwaitingCompletion, "Auth URL: https://x.example"),
            None
        );
    }
}
