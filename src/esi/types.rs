//! Mirrored record types. Only the fields the mirror needs are kept.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::Entity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractType {
  ItemExchange,
  Auction,
  Courier,
  Loan,
  #[serde(other)]
  Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
  pub contract_id: i64,
  pub issuer_id: i64,
  pub issuer_corporation_id: i64,
  pub assignee_id: i64,
  #[serde(default)]
  pub acceptor_id: i64,
  #[serde(rename = "type")]
  pub contract_type: ContractType,
  pub status: String,
  #[serde(default)]
  pub title: Option<String>,
  pub availability: String,
  pub for_corporation: bool,
  pub date_issued: DateTime<Utc>,
  pub date_expired: DateTime<Utc>,
  #[serde(default)]
  pub date_completed: Option<DateTime<Utc>>,
  #[serde(default)]
  pub price: Option<f64>,
  #[serde(default)]
  pub reward: Option<f64>,
  #[serde(default)]
  pub collateral: Option<f64>,
  #[serde(default)]
  pub volume: Option<f64>,
  #[serde(default)]
  pub start_location_id: Option<i64>,
  #[serde(default)]
  pub end_location_id: Option<i64>,
}

impl Contract {
  /// Whether the contract carries goods whose line items are worth fetching.
  pub fn needs_items(&self) -> bool {
    matches!(
      self.contract_type,
      ContractType::ItemExchange | ContractType::Auction
    )
  }
}

impl Entity for Contract {
  fn record_id(&self) -> i64 {
    self.contract_id
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractItem {
  pub record_id: i64,
  pub type_id: i64,
  pub quantity: i64,
  pub is_included: bool,
  pub is_singleton: bool,
  #[serde(default)]
  pub raw_quantity: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndustryJob {
  pub job_id: i64,
  pub installer_id: i64,
  pub activity_id: i32,
  pub blueprint_id: i64,
  pub blueprint_type_id: i64,
  #[serde(default)]
  pub product_type_id: Option<i64>,
  pub runs: i32,
  pub status: String,
  pub start_date: DateTime<Utc>,
  pub end_date: DateTime<Utc>,
  #[serde(default)]
  pub completed_date: Option<DateTime<Utc>>,
  /// Character endpoints report `station_id`, corporation endpoints `location_id`.
  #[serde(default, alias = "station_id")]
  pub location_id: Option<i64>,
}

impl Entity for IndustryJob {
  fn record_id(&self) -> i64 {
    self.job_id
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
  pub item_id: i64,
  pub type_id: i64,
  pub location_id: i64,
  pub location_flag: String,
  /// -1 for an original, -2 for a copy, otherwise a stack size.
  pub quantity: i64,
  pub material_efficiency: i32,
  pub time_efficiency: i32,
  /// -1 for an original.
  pub runs: i32,
}

impl Entity for Blueprint {
  fn record_id(&self) -> i64 {
    self.item_id
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Starbase {
  pub starbase_id: i64,
  pub type_id: i64,
  pub system_id: i64,
  #[serde(default)]
  pub moon_id: Option<i64>,
  #[serde(default)]
  pub state: Option<String>,
  #[serde(default)]
  pub reinforced_until: Option<DateTime<Utc>>,
}

impl Entity for Starbase {
  fn record_id(&self) -> i64 {
    self.starbase_id
  }
}
