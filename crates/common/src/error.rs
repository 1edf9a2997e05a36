//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Usb(#[from] usb_types::UsbError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_error_conversion() {
        let err: Error = usb_types::UsbError::Disconnected.into();
        assert!(matches!(err, Error::Usb(usb_types::UsbError::Disconnected)));
        assert_eq!(err.to_string(), "USB error: device is disconnected");
    }

    #[test]
    fn test_config_parse_error_conversion() {
        let parse: std::result::Result<toml::Value, _> = toml::from_str("timeout_millis = ");
        let err: Error = parse.unwrap_err().into();
        assert!(err.to_string().starts_with("Config parse error"));
    }
}
