//! Word list and code handling.
//!
//! A full code is `{nameplate}-{word1}-{word2}`: the numeric nameplate the
//! control plane allocated, plus two words sampled uniformly from the
//! embedded list. The words never travel through the control plane; they
//! only reach the peer out-of-band and feed the PAKE password.

use std::fmt;

use once_cell::sync::Lazy;
use rand::Rng;

/// Embedded list, one `index<TAB>word` per line, `#` comments ignored.
const WORDLIST: &str = include_str!("wordlist.txt");

static WORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    WORDLIST
        .lines()
        .map(str::trim)
        .filter(|ln| !ln.is_empty() && !ln.starts_with('#'))
        .filter_map(|ln| ln.split('\t').nth(1))
        .collect()
});

/// Returns the parsed word list.
pub fn words() -> &'static [&'static str] {
    &WORDS
}

/// Samples one word uniformly.
pub fn random_word() -> &'static str {
    let ws = words();
    ws[rand::thread_rng().gen_range(0..ws.len())]
}

/// Errors from parsing a full code.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodeError {
    #[error("bad code format: want '<nameplate>-<word>-<word>'")]
    BadFormat,
    #[error("bad nameplate: want 3-4 decimal digits")]
    BadNameplate,
}

/// A full human-memorable code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Code {
    nameplate: String,
    passphrase: String,
}

impl Code {
    /// Builds a fresh code from an allocated nameplate and two sampled words.
    pub fn generate(nameplate: &str) -> Self {
        Self {
            nameplate: nameplate.to_string(),
            passphrase: format!("{}-{}", random_word(), random_word()),
        }
    }

    /// Parses `<nameplate>-<word>-...` splitting the nameplate off the front.
    pub fn parse(s: &str) -> Result<Self, CodeError> {
        let s = s.trim();
        let mut parts = s.splitn(2, '-');
        let nameplate = parts.next().ok_or(CodeError::BadFormat)?;
        let passphrase = parts.next().ok_or(CodeError::BadFormat)?;
        if !passphrase.contains('-') {
            return Err(CodeError::BadFormat);
        }
        if !(3..=4).contains(&nameplate.len())
            || !nameplate.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(CodeError::BadNameplate);
        }
        Ok(Self {
            nameplate: nameplate.to_string(),
            passphrase: passphrase.to_string(),
        })
    }

    /// The numeric prefix, the control plane's database key.
    pub fn nameplate(&self) -> &str {
        &self.nameplate
    }

    /// The word portion (without the nameplate).
    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.nameplate, self.passphrase)
    }
}

/// Quick shape check used by the CLI to recognize a positional code
/// argument: `^\d{3,4}-[a-z]+-[a-z]+$`.
pub fn looks_like_code(s: &str) -> bool {
    let parts: Vec<&str> = s.split('-').collect();
    if parts.len() != 3 {
        return false;
    }
    let np = parts[0];
    (3..=4).contains(&np.len())
        && np.bytes().all(|b| b.is_ascii_digit())
        && parts[1..]
            .iter()
            .all(|w| !w.is_empty() && w.bytes().all(|b| b.is_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wordlist_parses_and_skips_comments() {
        let ws = words();
        assert!(ws.len() > 100);
        for w in ws {
            assert!(!w.is_empty());
            assert!(w.bytes().all(|b| b.is_ascii_lowercase()));
        }
    }

    #[test]
    fn generated_code_roundtrips() {
        let code = Code::generate("250");
        let parsed = Code::parse(&code.to_string()).unwrap();
        assert_eq!(parsed, code);
        assert_eq!(parsed.nameplate(), "250");
    }

    #[test]
    fn parse_splits_nameplate_off_the_front() {
        let code = Code::parse("1234-acorn-basin").unwrap();
        assert_eq!(code.nameplate(), "1234");
        assert_eq!(code.passphrase(), "acorn-basin");
    }

    #[test]
    fn parse_rejects_malformed_codes() {
        assert_eq!(Code::parse("junk"), Err(CodeError::BadFormat));
        assert_eq!(Code::parse("250-onlyoneword"), Err(CodeError::BadFormat));
        assert_eq!(Code::parse("25-acorn-basin"), Err(CodeError::BadNameplate));
        assert_eq!(Code::parse("25x-acorn-basin"), Err(CodeError::BadNameplate));
        assert_eq!(
            Code::parse("12345-acorn-basin"),
            Err(CodeError::BadNameplate)
        );
    }

    #[test]
    fn code_shape_check() {
        assert!(looks_like_code("250-acorn-basin"));
        assert!(looks_like_code("1234-gust-fable"));
        assert!(!looks_like_code("250-acorn"));
        assert!(!looks_like_code("250-Acorn-basin"));
        assert!(!looks_like_code("ab0-acorn-basin"));
        assert!(!looks_like_code("250-acorn-basin-extra"));
    }

    #[test]
    fn sampling_stays_in_list() {
        for _ in 0..32 {
            assert!(words().contains(&random_word()));
        }
    }
}
