//! レコードの値をフィールドの集合へ変換するパーサー。
//!
//! 組み込みのパーサーは[ParserConfig]で選択する。それ以外の形式は[IParser]を実装して組み込む。
use crate::error::{ConfigError, DecodeError};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

pub type FieldMap = Map<String, Value>;

/// レコードの値をデコードする。
///
/// 1件の値から0件以上のフィールドの集合を返してよい。
pub trait IParser: 'static + Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Vec<FieldMap>, DecodeError>;
}

fn default_message_key() -> String {
    "message".to_string()
}

fn default_delimiter() -> String {
    "\t".to_string()
}

fn default_label_delimiter() -> String {
    ":".to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParserConfig {
    None {
        #[serde(default = "default_message_key")]
        message_key: String,
    },
    Json,
    Ltsv {
        #[serde(default = "default_delimiter")]
        delimiter: String,
        #[serde(default = "default_label_delimiter")]
        label_delimiter: String,
    },
    Regexp {
        expression: String,
    },
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig::None {
            message_key: default_message_key(),
        }
    }
}

impl ParserConfig {
    pub fn build(&self) -> Result<Box<dyn IParser>, ConfigError> {
        let parser: Box<dyn IParser> = match self {
            ParserConfig::None { message_key } => Box::new(NoneParser::new(message_key)),
            ParserConfig::Json => Box::new(JsonParser),
            ParserConfig::Ltsv {
                delimiter,
                label_delimiter,
            } => {
                if delimiter.is_empty() || label_delimiter.is_empty() {
                    return Err(ConfigError::invalid("parser", "ltsv delimiters must not be empty"));
                }
                Box::new(LtsvParser {
                    delimiter: delimiter.clone(),
                    label_delimiter: label_delimiter.clone(),
                })
            }
            ParserConfig::Regexp { expression } => Box::new(RegexpParser::new(expression)?),
        };
        Ok(parser)
    }
}

/// 値をそのまま1つのフィールドに格納する。
pub struct NoneParser {
    message_key: String,
}

impl NoneParser {
    pub fn new(message_key: &str) -> Self {
        Self {
            message_key: message_key.to_string(),
        }
    }
}

impl IParser for NoneParser {
    fn decode(&self, bytes: &[u8]) -> Result<Vec<FieldMap>, DecodeError> {
        let mut fields = FieldMap::new();
        fields.insert(
            self.message_key.clone(),
            Value::String(String::from_utf8_lossy(bytes).into_owned()),
        );
        Ok(vec![fields])
    }
}

/// JSONオブジェクト、またはJSONオブジェクトの配列をデコードする。
pub struct JsonParser;

impl IParser for JsonParser {
    fn decode(&self, bytes: &[u8]) -> Result<Vec<FieldMap>, DecodeError> {
        match serde_json::from_slice::<Value>(bytes)? {
            Value::Object(fields) => Ok(vec![fields]),
            Value::Array(values) => values
                .into_iter()
                .map(|value| match value {
                    Value::Object(fields) => Ok(fields),
                    other => Err(DecodeError::Unsupported(format!(
                        "array element is not an object: {}",
                        other
                    ))),
                })
                .collect(),
            other => Err(DecodeError::Unsupported(format!(
                "expected an object but got {}",
                other
            ))),
        }
    }
}

/// Labeled Tab-separated Values
pub struct LtsvParser {
    delimiter: String,
    label_delimiter: String,
}

impl IParser for LtsvParser {
    fn decode(&self, bytes: &[u8]) -> Result<Vec<FieldMap>, DecodeError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| DecodeError::Unsupported(e.to_string()))?
            .trim_end_matches(&['\r', '\n'][..]);
        let mut fields = FieldMap::new();
        for item in text.split(self.delimiter.as_str()).filter(|s| !s.is_empty()) {
            let (label, value) = item
                .split_once(self.label_delimiter.as_str())
                .ok_or_else(|| DecodeError::Mismatch(format!("no label in '{}'", item)))?;
            fields.insert(label.to_string(), Value::String(value.to_string()));
        }
        Ok(vec![fields])
    }
}

/// 名前付きキャプチャをフィールドとして取り出す。
///
/// `expression`は`/.../`で囲んでもよい。
pub struct RegexpParser {
    regex: Regex,
}

impl RegexpParser {
    pub fn new(expression: &str) -> Result<Self, ConfigError> {
        let expression = expression
            .strip_prefix('/')
            .and_then(|s| s.strip_suffix('/'))
            .unwrap_or(expression);
        let regex = Regex::new(expression)?;
        if regex.capture_names().flatten().next().is_none() {
            return Err(ConfigError::invalid(
                "parser.expression",
                "at least one named capture is required",
            ));
        }
        Ok(Self { regex })
    }
}

impl IParser for RegexpParser {
    fn decode(&self, bytes: &[u8]) -> Result<Vec<FieldMap>, DecodeError> {
        let text = String::from_utf8_lossy(bytes);
        let captures = self
            .regex
            .captures(&text)
            .ok_or_else(|| DecodeError::Mismatch(text.to_string()))?;
        let fields = self
            .regex
            .capture_names()
            .flatten()
            .filter_map(|name| {
                captures
                    .name(name)
                    .map(|m| (name.to_string(), Value::String(m.as_str().to_string())))
            })
            .collect::<FieldMap>();
        Ok(vec![fields])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_none_parser() {
        let parser = ParserConfig::default().build().unwrap();
        let fields = parser.decode(b"Hello, world").unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(Value::Object(fields[0].clone()), json!({"message": "Hello, world"}));
    }

    #[test]
    fn test_none_parser_with_custom_key() {
        let config: ParserConfig =
            serde_json::from_value(json!({"type": "none", "message_key": "log"})).unwrap();
        let fields = config.build().unwrap().decode(b"line").unwrap();
        assert_eq!(fields[0]["log"], "line");
    }

    #[test]
    fn test_json_parser() {
        let parser = JsonParser;
        let fields = parser.decode(br#"{"a": 1, "b": "x"}"#).unwrap();
        assert_eq!(Value::Object(fields[0].clone()), json!({"a": 1, "b": "x"}));

        let fields = parser.decode(br#"[{"a": 1}, {"a": 2}]"#).unwrap();
        assert_eq!(fields.len(), 2);

        assert!(matches!(parser.decode(b"42"), Err(DecodeError::Unsupported(_))));
        assert!(matches!(parser.decode(b"{broken"), Err(DecodeError::Json(_))));
        assert!(parser.decode(br#"[{"a": 1}, 2]"#).is_err());
    }

    #[test]
    fn test_ltsv_parser() {
        let config: ParserConfig = serde_json::from_value(json!({"type": "ltsv"})).unwrap();
        let fields = config
            .build()
            .unwrap()
            .decode(b"host:127.0.0.1\tpath:/index.html\n")
            .unwrap();
        assert_eq!(
            Value::Object(fields[0].clone()),
            json!({"host": "127.0.0.1", "path": "/index.html"})
        );
        assert!(config.build().unwrap().decode(b"nolabel").is_err());
    }

    #[test]
    fn test_regexp_parser() {
        let parser = RegexpParser::new(r"/^(?P<level>\w+) (?P<body>.*)$/").unwrap();
        let fields = parser.decode(b"INFO started").unwrap();
        assert_eq!(
            Value::Object(fields[0].clone()),
            json!({"level": "INFO", "body": "started"})
        );
        assert!(matches!(parser.decode(b"???"), Err(DecodeError::Mismatch(_))));
        assert!(RegexpParser::new("no captures").is_err());
        assert!(RegexpParser::new("(?P<broken").is_err());
    }
}
