//! Call surface of the deployed supply-chain contract.
//!
//! Function names, argument shapes and return-value decoding live here so
//! that the client components and the in-process ledger agree on one wire
//! format. Unset reference fields come back as the zero address, and a
//! lookup of a missing product returns a zeroed struct (`id == 0`), the same
//! way a contract mapping read behaves.

use agri_lifecycle::{Action, Address, Product, Profile, Role, Stage};
use serde_json::{json, Value};

use crate::errors::{Result, TrackerError};

pub const OWNER: &str = "Owner";
pub const PRODUCT_COUNT: &str = "productCtr";
pub const PRODUCT: &str = "ProductStock";
pub const SHOW_STAGE: &str = "showStage";
pub const USER_ROLE: &str = "getUserRole";

/// State-changing function for a lifecycle action.
pub fn action_function(action: Action) -> &'static str {
    match action {
        Action::Register => "addProduct",
        Action::Plant => "plantProduct",
        Action::Harvest => "harvestProduct",
        Action::Process => "processProduct",
        Action::Distribute => "distributeProduct",
        Action::Receive => "receiveProduct",
        Action::Sell => "sellProduct",
    }
}

pub fn action_for_function(function: &str) -> Option<Action> {
    Action::ALL
        .iter()
        .copied()
        .find(|action| action_function(*action) == function)
}

/// Owner-only function registering a participant under `role`.
pub fn register_function(role: Role) -> Option<&'static str> {
    match role {
        Role::Farmer => Some("addFarmer"),
        Role::Processor => Some("addProcessor"),
        Role::Distributor => Some("addDistributor"),
        Role::Retailer => Some("addRetailer"),
        Role::Owner | Role::Guest => None,
    }
}

pub fn role_for_register_function(function: &str) -> Option<Role> {
    Role::PARTICIPANTS
        .iter()
        .copied()
        .find(|role| register_function(*role) == Some(function))
}

/// Read function returning a participant's profile for `role`.
pub fn profile_function(role: Role) -> Option<&'static str> {
    match role {
        Role::Farmer => Some("getFarmer"),
        Role::Processor => Some("getProcessor"),
        Role::Distributor => Some("getDistributor"),
        Role::Retailer => Some("getRetailer"),
        Role::Owner | Role::Guest => None,
    }
}

pub fn role_for_profile_function(function: &str) -> Option<Role> {
    Role::PARTICIPANTS
        .iter()
        .copied()
        .find(|role| profile_function(*role) == Some(function))
}

// ─────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────

/// Integers arrive as JSON numbers, decimal strings or `0x` hex strings
/// depending on the node.
pub fn decode_u64(value: &Value) -> Result<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| TrackerError::EventParse(format!("not an unsigned integer: {n}"))),
        Value::String(s) => {
            let s = s.trim();
            let parsed = match s.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => s.parse(),
            };
            parsed.map_err(|_| TrackerError::EventParse(format!("not an unsigned integer: {s:?}")))
        }
        other => Err(TrackerError::EventParse(format!(
            "expected integer, got {other}"
        ))),
    }
}

/// Stages arrive either as the enum index or as a label.
pub fn decode_stage(value: &Value) -> Result<Stage> {
    match value {
        Value::String(s) if s.trim().parse::<u64>().is_err() => s
            .parse()
            .map_err(|e| TrackerError::EventParse(format!("{e}"))),
        other => {
            let index = decode_u64(other)?;
            Stage::from_index(index)
                .ok_or_else(|| TrackerError::EventParse(format!("stage index out of range: {index}")))
        }
    }
}

/// `None` for null, empty or zero-address values.
pub fn decode_address(value: &Value) -> Result<Option<Address>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => {
            let address = Address::parse(s)
                .map_err(|e| TrackerError::EventParse(format!("bad address: {e}")))?;
            Ok((!address.is_zero()).then_some(address))
        }
        other => Err(TrackerError::EventParse(format!(
            "expected address, got {other}"
        ))),
    }
}

fn field<'a>(value: &'a Value, key: &str) -> Result<&'a Value> {
    value
        .get(key)
        .ok_or_else(|| TrackerError::EventParse(format!("missing field {key:?}")))
}

fn text(value: &Value, key: &str) -> Result<String> {
    Ok(field(value, key)?.as_str().unwrap_or_default().to_string())
}

fn optional_address(value: &Value, key: &str) -> Result<Option<Address>> {
    value
        .get(key)
        .map(decode_address)
        .transpose()
        .map(Option::flatten)
}

/// Decode a `ProductStock` result. `Ok(None)` means the id was never
/// assigned.
pub fn decode_product(value: &Value) -> Result<Option<Product>> {
    let id = decode_u64(field(value, "id")?)?;
    if id == 0 {
        return Ok(None);
    }
    Ok(Some(Product {
        id,
        name: text(value, "name")?,
        description: text(value, "description")?,
        stage: decode_stage(field(value, "stage")?)?,
        farmer: optional_address(value, "farmer")?,
        processor: optional_address(value, "processor")?,
        distributor: optional_address(value, "distributor")?,
        retailer: optional_address(value, "retailer")?,
    }))
}

/// Decode a `getFarmer`-style result. An empty name means no such
/// participant.
pub fn decode_profile(value: &Value) -> Option<Profile> {
    let name = value.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }
    Some(Profile {
        name: name.to_string(),
        location: value
            .get("location")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

// ─────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────

pub fn encode_address(address: Option<&Address>) -> Value {
    match address {
        Some(address) => json!(address.as_str()),
        None => json!(Address::zero().as_str()),
    }
}

pub fn encode_product(product: &Product) -> Value {
    json!({
        "id": product.id,
        "name": product.name,
        "description": product.description,
        "stage": product.stage.index(),
        "farmer": encode_address(product.farmer.as_ref()),
        "processor": encode_address(product.processor.as_ref()),
        "distributor": encode_address(product.distributor.as_ref()),
        "retailer": encode_address(product.retailer.as_ref()),
    })
}

/// The zeroed struct a mapping read yields for an unassigned id.
pub fn empty_product() -> Value {
    json!({
        "id": 0,
        "name": "",
        "description": "",
        "stage": 0,
        "farmer": encode_address(None),
        "processor": encode_address(None),
        "distributor": encode_address(None),
        "retailer": encode_address(None),
    })
}

pub fn encode_profile(profile: Option<&Profile>) -> Value {
    match profile {
        Some(p) => json!({ "name": p.name, "location": p.location }),
        None => json!({ "name": "", "location": "" }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_names_round_trip() {
        for action in Action::ALL {
            assert_eq!(action_for_function(action_function(action)), Some(action));
        }
        for role in Role::PARTICIPANTS {
            let f = register_function(role).unwrap();
            assert_eq!(role_for_register_function(f), Some(role));
            let g = profile_function(role).unwrap();
            assert_eq!(role_for_profile_function(g), Some(role));
        }
        assert_eq!(register_function(Role::Owner), None);
    }

    #[test]
    fn integers_in_every_encoding() {
        assert_eq!(decode_u64(&json!(7)).unwrap(), 7);
        assert_eq!(decode_u64(&json!("7")).unwrap(), 7);
        assert_eq!(decode_u64(&json!("0x1f")).unwrap(), 31);
        assert!(decode_u64(&json!(-1)).is_err());
        assert!(decode_u64(&json!(true)).is_err());
    }

    #[test]
    fn stages_by_index_or_label() {
        assert_eq!(decode_stage(&json!(5)).unwrap(), Stage::InRetail);
        assert_eq!(decode_stage(&json!("5")).unwrap(), Stage::InRetail);
        assert_eq!(decode_stage(&json!("In Retail")).unwrap(), Stage::InRetail);
        assert!(decode_stage(&json!(12)).is_err());
    }

    #[test]
    fn zero_address_is_unset() {
        assert_eq!(decode_address(&encode_address(None)).unwrap(), None);
        assert_eq!(decode_address(&Value::Null).unwrap(), None);
        assert_eq!(
            decode_address(&json!("0x00000000000000000000000000000000000000Ff")).unwrap(),
            Some(Address::from_low_u64(255))
        );
    }

    #[test]
    fn product_round_trip_and_missing() {
        let product = Product {
            id: 3,
            name: "Cocoa".into(),
            description: "Fermented beans".into(),
            stage: Stage::Processed,
            farmer: Some(Address::from_low_u64(1)),
            processor: Some(Address::from_low_u64(2)),
            distributor: None,
            retailer: None,
        };
        assert_eq!(
            decode_product(&encode_product(&product)).unwrap(),
            Some(product)
        );
        assert_eq!(decode_product(&empty_product()).unwrap(), None);
        assert!(decode_product(&json!({ "id": 1 })).is_err());
    }

    #[test]
    fn empty_profile_is_absent() {
        assert_eq!(decode_profile(&encode_profile(None)), None);
        let profile = decode_profile(&json!({ "name": "Asha", "location": "Nashik" })).unwrap();
        assert_eq!(profile.location, "Nashik");
    }
}
