//! Positional field grammar of the legacy text messages.
//!
//! Fields are separated by blanks, tabs or newlines. Strings are wrapped in
//! double quotes with `\"` and `\\` as the only escapes, so user names and
//! chat text may contain blanks.

use std::fmt::Display;
use std::str::FromStr;

use crate::messages::MessageError;

/// Builds a text payload field by field.
#[derive(Debug, Default)]
pub(crate) struct TextWriter {
    out: String,
}

impl TextWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn separate(&mut self) {
        if !self.out.is_empty() {
            self.out.push(' ');
        }
    }

    /// Append a number or bare token.
    pub(crate) fn field(&mut self, value: impl Display) -> &mut Self {
        self.separate();
        self.out.push_str(&value.to_string());
        self
    }

    /// Append a quoted string.
    pub(crate) fn string(&mut self, value: &str) -> &mut Self {
        self.separate();
        self.out.push('"');
        for ch in value.chars() {
            if ch == '"' || ch == '\\' {
                self.out.push('\\');
            }
            self.out.push(ch);
        }
        self.out.push('"');
        self
    }

    pub(crate) fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out).into_bytes()
    }
}

/// Reads fields back in order.
pub(crate) struct TextReader<'a> {
    rest: &'a str,
}

impl<'a> TextReader<'a> {
    pub(crate) fn new(payload: &'a [u8]) -> Result<Self, MessageError> {
        let rest = std::str::from_utf8(payload).map_err(MessageError::Utf8)?;
        Ok(Self { rest })
    }

    fn skip_blanks(&mut self) {
        self.rest = self.rest.trim_start_matches([' ', '\t', '\n', '\r']);
    }

    /// Next bare token.
    pub(crate) fn token(&mut self, name: &'static str) -> Result<&'a str, MessageError> {
        self.skip_blanks();
        if self.rest.is_empty() {
            return Err(MessageError::MissingField(name));
        }
        let end = self
            .rest
            .find([' ', '\t', '\n', '\r'])
            .unwrap_or(self.rest.len());
        let (token, rest) = self.rest.split_at(end);
        self.rest = rest;
        Ok(token)
    }

    /// Next token parsed as `T`.
    pub(crate) fn parse<T: FromStr>(&mut self, name: &'static str) -> Result<T, MessageError> {
        let token = self.token(name)?;
        token.parse().map_err(|_| MessageError::InvalidField {
            field: name,
            value: token.to_string(),
        })
    }

    /// Next quoted string.
    pub(crate) fn string(&mut self, name: &'static str) -> Result<String, MessageError> {
        self.skip_blanks();
        let text = self.rest;
        let mut chars = text.char_indices();
        match chars.next() {
            Some((_, '"')) => {}
            Some(_) => {
                return Err(MessageError::InvalidField {
                    field: name,
                    value: text.chars().take(16).collect(),
                });
            }
            None => return Err(MessageError::MissingField(name)),
        }

        let mut value = String::new();
        let mut escaped = false;
        for (index, ch) in chars {
            if escaped {
                value.push(ch);
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                self.rest = &text[index + 1..];
                return Ok(value);
            } else {
                value.push(ch);
            }
        }
        Err(MessageError::InvalidField {
            field: name,
            value: format!("unterminated string {value:?}"),
        })
    }

    /// Whether every field has been read.
    pub(crate) fn is_exhausted(&mut self) -> bool {
        self.skip_blanks();
        self.rest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strings_with_blanks_and_escapes() {
        let payload = TextWriter::new()
            .string("anna maria")
            .field(12)
            .string("say \"hi\" \\ bye")
            .finish();
        assert_eq!(
            std::str::from_utf8(&payload).unwrap(),
            r#""anna maria" 12 "say \"hi\" \\ bye""#
        );

        let mut reader = TextReader::new(&payload).unwrap();
        assert_eq!(reader.string("user").unwrap(), "anna maria");
        assert_eq!(reader.parse::<u32>("number").unwrap(), 12);
        assert_eq!(reader.string("text").unwrap(), "say \"hi\" \\ bye");
        assert!(reader.is_exhausted());
    }

    #[test]
    fn test_tabs_and_newlines_separate_fields() {
        let mut reader = TextReader::new(b"1\t2\n 3").unwrap();
        let values: Vec<u8> = (0..3).map(|_| reader.parse("n").unwrap()).collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn test_missing_and_invalid_fields() {
        let mut reader = TextReader::new(b"abc").unwrap();
        assert!(matches!(
            reader.parse::<u32>("number"),
            Err(MessageError::InvalidField { field: "number", .. })
        ));
        assert!(matches!(
            reader.token("next"),
            Err(MessageError::MissingField("next"))
        ));
    }

    #[test]
    fn test_unterminated_string() {
        let mut reader = TextReader::new(b"\"open").unwrap();
        assert!(reader.string("user").is_err());
    }

    #[test]
    fn test_invalid_utf8_payload() {
        assert!(matches!(
            TextReader::new(&[0xff, 0xfe]),
            Err(MessageError::Utf8(_))
        ));
    }
}
