use std::io::{IsTerminal, Write, stdin, stdout};

/// Asks the operator before destructive or out-of-schedule work.
pub trait Confirmer: Send + Sync {
    fn confirm(&self, question: &str) -> bool;

    /// Whether a human can answer. Automated runs skip instead of asking.
    fn is_interactive(&self) -> bool;
}

/// Reads a yes/no answer from stdin.
pub struct StdinConfirmer;

impl Confirmer for StdinConfirmer {
    fn confirm(&self, question: &str) -> bool {
        print!("{} [y/N]: ", question);
        if stdout().flush().is_err() {
            return false;
        }

        let mut input = String::new();
        if stdin().read_line(&mut input).is_err() {
            return false;
        }
        parse_answer(&input)
    }

    fn is_interactive(&self) -> bool {
        stdin().is_terminal()
    }
}

/// Fixed answer, for `--yes` and for tests.
pub struct AutoConfirm(pub bool);

impl Confirmer for AutoConfirm {
    fn confirm(&self, _question: &str) -> bool {
        self.0
    }

    fn is_interactive(&self) -> bool {
        false
    }
}

fn parse_answer(input: &str) -> bool {
    matches!(input.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
