use clap::Args;
use dw_plugin::capability::EntityQuery;
use dw_plugin::entity::{Entity, to_wire};
use serde_json::{Map, Value};

use super::parse_assignment;
use darwinflow::host::Host;

#[derive(Args, Debug)]
pub struct QueryArgs {
    /// Entity type; all providers are asked when omitted
    #[arg(long = "type")]
    pub entity_type: Option<String>,

    #[arg(long, default_value_t = 0)]
    pub limit: usize,

    /// Field equality filter, repeatable
    #[arg(long = "filter", value_name = "KEY=VALUE")]
    pub filters: Vec<String>,
}

#[derive(Args, Debug)]
pub struct GetArgs {
    pub id: String,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    pub id: String,

    #[arg(value_name = "KEY=VALUE", required = true)]
    pub fields: Vec<String>,
}

fn print_entity(entity: &dyn Entity) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&to_wire(entity))?);
    Ok(())
}

fn assignments(raw: &[String]) -> anyhow::Result<Map<String, Value>> {
    raw.iter().map(|s| parse_assignment(s)).collect()
}

pub async fn query(host: &Host, args: QueryArgs) -> anyhow::Result<i32> {
    let query = EntityQuery {
        entity_type: args.entity_type.unwrap_or_default(),
        filters: assignments(&args.filters)?,
        limit: args.limit,
        ..Default::default()
    };
    let entities = host.registry().query(&query).await?;
    let wire: Vec<Value> = entities.iter().map(|e| to_wire(e.as_ref())).collect();
    println!("{}", serde_json::to_string_pretty(&wire)?);
    Ok(0)
}

pub async fn get(host: &Host, args: GetArgs) -> anyhow::Result<i32> {
    match host.registry().get_entity(&args.id).await {
        Ok(entity) => {
            print_entity(entity.as_ref())?;
            Ok(0)
        }
        Err(e) if e.is_not_found() => {
            eprintln!("No entity with id {}", args.id);
            Ok(1)
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn update(host: &Host, args: UpdateArgs) -> anyhow::Result<i32> {
    let fields = assignments(&args.fields)?;
    let entity = host.registry().update_entity(&args.id, fields).await?;
    print_entity(entity.as_ref())?;
    Ok(0)
}
