use serde::{Deserialize, Serialize};

use super::Preference;

/// App color scheme. `System` follows the platform appearance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

impl Preference for Theme {
    const LOCAL_KEY: &'static str = "theme";
    const REMOTE_FIELD: &'static str = "theme";

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "light" => Some(Theme::Light),
            "dark" => Some(Theme::Dark),
            "system" => Some(Theme::System),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
            Theme::System => "system",
        }
    }
}

/// Display currency for amounts shown in the app.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Currency {
    #[default]
    Usd,
    Eur,
    Gbp,
    Jpy,
    Cad,
    Aud,
}

impl Preference for Currency {
    const LOCAL_KEY: &'static str = "currency";
    const REMOTE_FIELD: &'static str = "currency";

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "usd" => Some(Currency::Usd),
            "eur" => Some(Currency::Eur),
            "gbp" => Some(Currency::Gbp),
            "jpy" => Some(Currency::Jpy),
            "cad" => Some(Currency::Cad),
            "aud" => Some(Currency::Aud),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "usd",
            Currency::Eur => "eur",
            Currency::Gbp => "gbp",
            Currency::Jpy => "jpy",
            Currency::Cad => "cad",
            Currency::Aud => "aud",
        }
    }
}
