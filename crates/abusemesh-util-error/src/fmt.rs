use std::error::Error as StdError;
use std::fmt;

/// Renders an error together with its `source()` chain on a single line,
/// e.g. `connect failed: connection refused: os error 111`.
///
/// Useful in `tracing` log statements where a multi-line `{:?}` dump would
/// break the one-event-per-line convention.
pub struct FmtCompact<'e>(&'e (dyn StdError + 'static));

impl fmt::Display for FmtCompact<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut cause = self.0.source();
        while let Some(err) = cause {
            write!(f, ": {err}")?;
            cause = err.source();
        }
        Ok(())
    }
}

pub trait AsFmtCompact {
    fn fmt_compact(&self) -> FmtCompact<'_>;
}

impl<E> AsFmtCompact for E
where
    E: StdError + 'static,
{
    fn fmt_compact(&self) -> FmtCompact<'_> {
        FmtCompact(self)
    }
}
