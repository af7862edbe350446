//! Built-in entity types of the Hyperlens explorer.
//!
//! Web3 ecosystem knowledge: projects and dapps with avatars, investors and
//! funding rounds, on-chain assets, plus the task and period records users
//! keep in their private spaces.

use crate::error::SchemaError;
use crate::schema::{EntityType, SchemaRegistry};
use crate::types::PrimitiveKind as Kind;

pub const IMAGE: &str = "Image";
pub const PROJECT: &str = "Project";
pub const DAPP: &str = "Dapp";
pub const INVESTOR: &str = "Investor";
pub const FUNDING_STAGE: &str = "FundingStage";
pub const INVESTMENT_ROUND: &str = "InvestmentRound";
pub const ASSET: &str = "Asset";
pub const TASK: &str = "Task";
pub const PERIOD: &str = "Period";

/// All catalog entity types, relation targets first.
pub fn entity_types() -> Vec<EntityType> {
    vec![
        EntityType::new(IMAGE).scalar("url", Kind::String),
        EntityType::new(PROJECT)
            .scalar("name", Kind::String)
            .scalar("description", Kind::String)
            .scalar("x", Kind::String)
            .relation("avatar", IMAGE),
        EntityType::new(DAPP)
            .scalar("name", Kind::String)
            .scalar("description", Kind::String)
            .scalar("x", Kind::String)
            .scalar("github", Kind::String)
            .relation("avatar", IMAGE),
        EntityType::new(INVESTOR).scalar("name", Kind::String),
        EntityType::new(FUNDING_STAGE).scalar("name", Kind::String),
        EntityType::new(INVESTMENT_ROUND)
            .scalar("name", Kind::String)
            .scalar("raisedAmount", Kind::Number)
            .relation("investors", INVESTOR)
            .relation("fundingStages", FUNDING_STAGE)
            .relation("raisedBy", PROJECT),
        EntityType::new(ASSET)
            .scalar("name", Kind::String)
            .scalar("symbol", Kind::String)
            .scalar("blockchainAddress", Kind::String),
        EntityType::new(TASK)
            .scalar("description", Kind::String)
            .scalar("name", Kind::String)
            .scalar("status", Kind::Boolean),
        EntityType::new(PERIOD)
            .scalar("startDate", Kind::Date)
            .scalar("endDate", Kind::Date)
            .scalar("month", Kind::String)
            .scalar("person", Kind::String)
            .optional("notes", Kind::String),
    ]
}

/// A registry holding the full catalog.
pub fn registry() -> Result<SchemaRegistry, SchemaError> {
    let mut registry = SchemaRegistry::new();
    for entity_type in entity_types() {
        registry.register(entity_type)?;
    }
    registry.verify_relations()?;
    Ok(registry)
}
