use log::{
    Record,
    kv::{Error, Key, Value, VisitSource},
};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::encode::{Color, Encode, Style, Write};
use serde::Deserialize;
use std::io;

const DEFAULT_PATTERN: &str = "{d} {l} {m}";

#[derive(Debug, Deserialize)]
pub struct StructuredConsoleEncoderConfig {
    pub pattern: Option<String>,
    /// Highlight keys. Ignored by writers without style support (files).
    pub highlight_keys: Option<bool>,
}

/// Pattern encoder that appends the record's key/value pairs as ` key=value`.
///
/// Values containing whitespace are quoted so a log line stays splittable on spaces.
#[derive(Debug)]
pub struct StructuredConsoleEncoder {
    delegate: PatternEncoder,
    highlight_keys: bool,
}

impl StructuredConsoleEncoder {
    pub fn new(pattern: &str, highlight_keys: bool) -> Self {
        Self {
            delegate: PatternEncoder::new(pattern),
            highlight_keys,
        }
    }
}

impl Encode for StructuredConsoleEncoder {
    fn encode(&self, w: &mut dyn Write, record: &Record) -> anyhow::Result<()> {
        self.delegate.encode(w, record)?;

        let mut visitor = KeyValueWriter {
            writer: w,
            highlight_keys: self.highlight_keys,
            io_err: None,
        };

        if let Err(kv_err) = record.key_values().visit(&mut visitor) {
            if let Some(io_err) = visitor.io_err {
                return Err(io_err.into());
            }
            write!(w, " [kv error: {}]", kv_err)?;
        }

        w.write_all(b"\n")?;
        Ok(())
    }
}

struct KeyValueWriter<'a> {
    writer: &'a mut dyn Write,
    highlight_keys: bool,
    io_err: Option<io::Error>,
}

impl KeyValueWriter<'_> {
    fn write_pair(&mut self, key: &str, value: &str) -> io::Result<()> {
        if self.highlight_keys {
            self.writer.set_style(Style::new().text(Color::Cyan))?;
        }
        write!(self.writer, " {}=", key)?;
        if self.highlight_keys {
            self.writer.set_style(&Style::default())?;
        }
        write!(self.writer, "{}", quote_if_needed(value))
    }
}

impl<'kvs> VisitSource<'kvs> for KeyValueWriter<'_> {
    fn visit_pair(&mut self, key: Key<'kvs>, value: Value<'kvs>) -> Result<(), Error> {
        let rendered = value.to_string();
        if let Err(e) = self.write_pair(key.as_str(), &rendered) {
            self.io_err = Some(e);
            return Err(Error::msg("io error during visit"));
        }
        Ok(())
    }
}

fn quote_if_needed(value: &str) -> String {
    if value.is_empty() || value.chars().any(char::is_whitespace) {
        format!("{:?}", value)
    } else {
        value.to_string()
    }
}

pub struct StructuredConsoleEncoderDeserializer;

impl log4rs::config::Deserialize for StructuredConsoleEncoderDeserializer {
    type Trait = dyn Encode;
    type Config = StructuredConsoleEncoderConfig;

    fn deserialize(
        &self,
        config: StructuredConsoleEncoderConfig,
        _: &log4rs::config::Deserializers,
    ) -> anyhow::Result<Box<dyn Encode>> {
        let pattern = config.pattern.as_deref().unwrap_or(DEFAULT_PATTERN);
        Ok(Box::new(StructuredConsoleEncoder::new(
            pattern,
            config.highlight_keys.unwrap_or(true),
        )))
    }
}
