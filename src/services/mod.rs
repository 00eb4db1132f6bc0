pub mod adjudicator;
pub mod catalog;
pub mod crop;
pub mod dedup;
pub mod detection;
pub mod enhancement;
pub mod identification;
pub mod intake;
pub mod ledger;
pub mod open_food_facts;
pub mod pipeline;
pub mod prediction;
pub mod pricing;
pub mod progress;
pub mod queue;
pub mod sku;
pub mod storage;
pub mod upc_lookup;
pub mod validation;
