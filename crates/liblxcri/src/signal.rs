//! Signal name and number parsing for the `kill` verb.

use nix::sys::signal::Signal as NixSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal(NixSignal);

#[derive(Debug, thiserror::Error)]
#[error("invalid signal: {0}")]
pub struct InvalidSignal(String);

impl Signal {
    pub fn as_raw(self) -> NixSignal {
        self.0
    }
}

impl From<NixSignal> for Signal {
    fn from(s: NixSignal) -> Self {
        Signal(s)
    }
}

impl TryFrom<i32> for Signal {
    type Error = InvalidSignal;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        NixSignal::try_from(value)
            .map(Signal)
            .map_err(|_| InvalidSignal(value.to_string()))
    }
}

impl std::str::FromStr for Signal {
    type Err = InvalidSignal;

    /// Accepts a number ("9"), a short name ("KILL", case insensitive) or
    /// a full name ("SIGKILL").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(num) = s.parse::<i32>() {
            return Signal::try_from(num);
        }

        let mut name = s.to_ascii_uppercase();
        if !name.starts_with("SIG") {
            name.insert_str(0, "SIG");
        }
        name.parse::<NixSignal>()
            .map(Signal)
            .map_err(|_| InvalidSignal(s.to_string()))
    }
}
