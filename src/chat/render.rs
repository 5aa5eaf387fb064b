//! Output rendering for the chat application.
//!
//! A [`ChatSession`](super::ChatSession) forwards every transcript change it makes while a reply
//! streams to a [`Renderer`], so a front end can draw the reply as it arrives.

use std::io::{self, Stdout, Write};

/// ANSI escape code for dim text (used for informational lines).
const ANSI_DIM: &str = "\x1b[2m";

/// ANSI escape code to reset all styling.
const ANSI_RESET: &str = "\x1b[0m";

/// ANSI escape code for red text (used for errors).
const ANSI_RED: &str = "\x1b[31m";

/// ANSI escape code for yellow text (used for interruptions).
const ANSI_YELLOW: &str = "\x1b[33m";

/// Trait for rendering chat output.
///
/// This abstraction allows for different rendering strategies:
/// - Plain text with ANSI styling
/// - Plain text without styling (for piping/redirecting)
/// - Capturing output in tests
pub trait Renderer: Send {
    /// Print a chunk of response text.
    ///
    /// This is called incrementally as tokens are streamed from the endpoint.
    fn print_text(&mut self, text: &str);

    /// Print an error message.
    fn print_error(&mut self, error: &str);

    /// Print an informational message.
    fn print_info(&mut self, info: &str);

    /// Called when a response is complete.
    ///
    /// `full_response` is the final text of the reply, which may differ from the tokens
    /// printed so far.
    fn finish_response(&mut self, full_response: &str);

    /// Called when the stream is interrupted by the user.
    fn print_interrupted(&mut self);
}

/// Plain text renderer with optional ANSI styling.
pub struct PlainTextRenderer {
    stdout: Stdout,
    use_color: bool,
    printed: String,
}

impl PlainTextRenderer {
    /// Creates a new PlainTextRenderer with ANSI colors enabled.
    pub fn new() -> Self {
        Self::with_color(true)
    }

    /// Creates a new PlainTextRenderer with specified color setting.
    pub fn with_color(use_color: bool) -> Self {
        Self {
            stdout: io::stdout(),
            use_color,
            printed: String::new(),
        }
    }

    /// Flushes stdout to ensure immediate display of streamed content.
    fn flush(&mut self) {
        let _ = self.stdout.flush();
    }

    fn styled(&self, style: &str, text: &str) -> String {
        if self.use_color {
            format!("{style}{text}{ANSI_RESET}")
        } else {
            text.to_string()
        }
    }
}

impl Default for PlainTextRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for PlainTextRenderer {
    fn print_text(&mut self, text: &str) {
        self.printed.push_str(text);
        print!("{text}");
        self.flush();
    }

    fn print_error(&mut self, error: &str) {
        let line = self.styled(ANSI_RED, &format!("Error: {error}"));
        eprintln!("\n{line}");
        self.printed.clear();
    }

    fn print_info(&mut self, info: &str) {
        println!("{}", self.styled(ANSI_DIM, info));
    }

    fn finish_response(&mut self, full_response: &str) {
        // Tokens went to the terminal as they came; show the canonical text if it differs.
        if !full_response.is_empty() && self.printed != full_response {
            println!();
            print!("{}", self.styled(ANSI_DIM, "[final] "));
            print!("{full_response}");
        }
        println!();
        self.printed.clear();
        self.flush();
    }

    fn print_interrupted(&mut self) {
        println!("\n{}", self.styled(ANSI_YELLOW, "[interrupted]"));
        self.printed.clear();
        self.flush();
    }
}
