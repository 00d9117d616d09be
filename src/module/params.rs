//! Instance parameter tokenizer
//!
//! Turns the configured parameter string into argv tokens. Tokens are separated
//! by whitespace; a token may be wrapped in single or double quotes to keep
//! spaces. Quoting is strict: a quote may only open a token, quoted tokens may
//! not be empty, every quote must be closed, and a double-quoted token may not
//! contain an apostrophe.

use thiserror::Error;

use crate::module::traits::ModuleError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamsError {
    #[error("quote {quote} in the middle of a word at offset {offset}")]
    QuoteInWord { quote: char, offset: usize },

    #[error("empty quoted token at offset {offset}")]
    EmptyQuotes { offset: usize },

    #[error("unterminated {quote} opened at offset {offset}")]
    Unterminated { quote: char, offset: usize },

    #[error("apostrophe inside double quotes at offset {offset}")]
    ApostropheInQuotes { offset: usize },
}

impl From<ParamsError> for ModuleError {
    fn from(err: ParamsError) -> Self {
        ModuleError::InvalidParams(err.to_string())
    }
}

/// Split a parameter string into tokens
pub fn tokenize_params(params: &str) -> Result<Vec<String>, ParamsError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = params.char_indices();

    while let Some((offset, c)) = chars.next() {
        match c {
            '\'' | '"' => {
                if !current.is_empty() {
                    return Err(ParamsError::QuoteInWord { quote: c, offset });
                }
                let mut closed = false;
                for (inner_offset, inner) in chars.by_ref() {
                    if inner == c {
                        closed = true;
                        break;
                    }
                    if c == '"' && inner == '\'' {
                        return Err(ParamsError::ApostropheInQuotes {
                            offset: inner_offset,
                        });
                    }
                    current.push(inner);
                }
                if !closed {
                    return Err(ParamsError::Unterminated { quote: c, offset });
                }
                if current.is_empty() {
                    return Err(ParamsError::EmptyQuotes { offset });
                }
                tokens.push(std::mem::take(&mut current));
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Build the exec argument vector of an instance
///
/// `[instance, ...params, "-i", ifc_spec]`; the `-i` pair is only present when
/// an interface specification is given.
pub fn build_exec_args(
    instance: &str,
    params: Option<&str>,
    ifc_spec: Option<String>,
) -> Result<Vec<String>, ParamsError> {
    let mut args = vec![instance.to_string()];
    if let Some(params) = params {
        args.extend(tokenize_params(params)?);
    }
    if let Some(spec) = ifc_spec {
        args.push("-i".to_string());
        args.push(spec);
    }
    Ok(args)
}
