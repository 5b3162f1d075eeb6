// Terminal output helpers for CLI commands. Everything goes to stderr so
// stdout stays free for `--results` and `--expanded` dumps.

/// ANSI styles used by the CLI
#[derive(Debug, Clone, Copy)]
enum Style {
    Heading,
    Accent,
    Good,
    Bad,
    Muted,
}

impl Style {
    fn code(self) -> &'static str {
        match self {
            Style::Heading => "1",
            Style::Accent => "1;36",
            Style::Good => "32",
            Style::Bad => "1;31",
            Style::Muted => "2",
        }
    }
}

fn paint(style: Style, text: &str) -> String {
    format!("\x1b[{}m{}\x1b[0m", style.code(), text)
}

/// Right-aligned action word followed by a message
pub fn status(action: &str, message: &str) {
    eprintln!("{} {}", paint(Style::Accent, &format!("{:>12}", action)), message);
}

pub fn header(message: &str) {
    eprintln!("{}", paint(Style::Heading, &format!("==> {}", message)));
}

pub fn success(message: &str) {
    eprintln!("  {} {}", paint(Style::Good, "\u{2713}"), message);
}

pub fn failure(message: &str) {
    eprintln!("  {} {}", paint(Style::Bad, "\u{2717}"), message);
}

/// A passed validation check
pub fn check(message: &str) {
    success(message);
}

pub fn error(message: &str) {
    eprintln!("{} {}", paint(Style::Bad, "error:"), message);
}

pub fn info(message: &str) {
    eprintln!("  {} {}", paint(Style::Accent, "i"), message);
}

pub fn dim(message: &str) {
    eprintln!("{}", paint(Style::Muted, message));
}

pub fn dim_success(message: &str) {
    eprintln!("{}", paint(Style::Good, message));
}

pub fn loop_header(name: &str, counter: i64, loopcount: usize) {
    eprintln!(
        "  {} '{}' pass {}/{}",
        paint(Style::Heading, "loop"),
        name,
        counter,
        loopcount
    );
}
