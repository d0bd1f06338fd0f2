use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Subcommand};
use rust_decimal::Decimal;

use streamcqrs::OrderRequest;

use crate::commands::{open_pipeline, print_json};

#[derive(Subcommand)]
pub enum OrderCommands {
    /// Store one order record
    Put(OrderPutArgs),
}

#[derive(Args)]
pub struct OrderPutArgs {
    /// Full write API body as JSON (camelCase fields)
    #[arg(long, conflicts_with_all = ["account", "vendor"])]
    pub json: Option<String>,

    #[arg(long)]
    pub account: Option<String>,

    #[arg(long)]
    pub vendor: Option<String>,

    #[arg(long, default_value = "")]
    pub order_date: String,

    #[arg(long, default_value = "")]
    pub city: String,

    #[arg(long, default_value = "")]
    pub item_type: String,

    #[arg(long, default_value = "")]
    pub item_size: String,

    #[arg(long)]
    pub unit_price: Option<Decimal>,

    #[arg(long)]
    pub quantity: Option<Decimal>,
}

#[derive(Subcommand)]
pub enum SummaryCommands {
    /// Print the current summary of an account
    Get {
        /// Account identifier
        account: String,
    },
}

pub fn execute(config_path: Option<PathBuf>, command: OrderCommands) -> Result<()> {
    match command {
        OrderCommands::Put(args) => {
            let request = build_request(args)?;
            let pipeline = open_pipeline(config_path)?;
            let receipt = pipeline.command_gateway().submit_order(request)?;
            print_json(&receipt)
        }
    }
}

pub fn execute_summary(config_path: Option<PathBuf>, command: SummaryCommands) -> Result<()> {
    match command {
        SummaryCommands::Get { account } => {
            let pipeline = open_pipeline(config_path)?;
            match pipeline.query_gateway().get_summary(&account)? {
                Some(record) => print_json(&record),
                None => {
                    println!("null");
                    Ok(())
                }
            }
        }
    }
}

fn build_request(args: OrderPutArgs) -> Result<OrderRequest> {
    if let Some(raw) = args.json {
        return serde_json::from_str(&raw).context("failed to parse order JSON");
    }

    Ok(OrderRequest {
        account_id: args
            .account
            .ok_or_else(|| anyhow!("--account is required unless --json is given"))?,
        vendor_id: args
            .vendor
            .ok_or_else(|| anyhow!("--vendor is required unless --json is given"))?,
        order_date: args.order_date,
        city: args.city,
        item_type: args.item_type,
        item_size: args.item_size,
        unit_price: args
            .unit_price
            .ok_or_else(|| anyhow!("--unit-price is required unless --json is given"))?,
        quantity: args
            .quantity
            .ok_or_else(|| anyhow!("--quantity is required unless --json is given"))?,
    })
}
