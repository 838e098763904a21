//! The closed set of expense categories a receipt can be filed under.
//!
//! The model is asked to pick exactly one of these; anything else it returns
//! is rejected by [`crate::pipeline::schema`] rather than silently mapped to
//! a nearest match.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the six expense categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpenseCategory {
    #[serde(rename = "Food & Drinks")]
    FoodAndDrinks,
    #[serde(rename = "Events & Entertainment")]
    EventsAndEntertainment,
    #[serde(rename = "Travel & Transport")]
    TravelAndTransport,
    #[serde(rename = "Housing & Utilities")]
    HousingAndUtilities,
    #[serde(rename = "Shopping & Essentials")]
    ShoppingAndEssentials,
    #[serde(rename = "On-Chain Life")]
    OnChainLife,
}

impl ExpenseCategory {
    /// All categories, in prompt order.
    pub const ALL: [ExpenseCategory; 6] = [
        ExpenseCategory::FoodAndDrinks,
        ExpenseCategory::EventsAndEntertainment,
        ExpenseCategory::TravelAndTransport,
        ExpenseCategory::HousingAndUtilities,
        ExpenseCategory::ShoppingAndEssentials,
        ExpenseCategory::OnChainLife,
    ];

    /// The exact label the model must return.
    pub fn as_str(self) -> &'static str {
        match self {
            ExpenseCategory::FoodAndDrinks => "Food & Drinks",
            ExpenseCategory::EventsAndEntertainment => "Events & Entertainment",
            ExpenseCategory::TravelAndTransport => "Travel & Transport",
            ExpenseCategory::HousingAndUtilities => "Housing & Utilities",
            ExpenseCategory::ShoppingAndEssentials => "Shopping & Essentials",
            ExpenseCategory::OnChainLife => "On-Chain Life",
        }
    }

    /// One-line description used in the extraction prompt.
    pub fn description(self) -> &'static str {
        match self {
            ExpenseCategory::FoodAndDrinks => {
                "Restaurants, bars, cafés, deliveries, shared grocery shopping"
            }
            ExpenseCategory::EventsAndEntertainment => {
                "Festivals, concerts, cinema, clubs, parties, group activities"
            }
            ExpenseCategory::TravelAndTransport => {
                "Public transport, taxis, ride sharing, fuel, plane/train tickets"
            }
            ExpenseCategory::HousingAndUtilities => {
                "Accommodation (Airbnb, hotels), shared rent, bills, collective subscriptions"
            }
            ExpenseCategory::ShoppingAndEssentials => {
                "Non-food purchases: clothing, equipment, gifts, pharmacy"
            }
            ExpenseCategory::OnChainLife => {
                "NFTs, mints, gas fees, shared wallets, digital subscriptions, apps/games"
            }
        }
    }

    /// Comma-separated list of every valid label.
    pub fn valid_names() -> String {
        Self::ALL
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Markdown bullet list of `- **Label**: description` lines for the prompt.
    pub fn prompt_listing() -> String {
        Self::ALL
            .iter()
            .map(|c| format!("- **{}**: {}", c.as_str(), c.description()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Display for ExpenseCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for a label outside [`ExpenseCategory::ALL`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCategory(pub String);

impl FromStr for ExpenseCategory {
    type Err = UnknownCategory;

    /// Exact, case-sensitive match on the label.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}
