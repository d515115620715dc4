use clap::Subcommand;
use serde_json::json;

#[derive(Subcommand)]
pub enum AdminCommands {
    /// Generate an admin API key (offline). Only the hash goes into server config.
    CreateKey,
}

pub fn run(command: AdminCommands) -> i32 {
    match command {
        AdminCommands::CreateKey => create_key(),
    }
}

fn create_key() -> i32 {
    let (key, hash) = tripwire_core::auth::generate_api_key();
    let output = json!({
        "api_key": key,
        "key_prefix": tripwire_core::auth::key_prefix(&key),
        "key_hash": hash,
        "note": "Store the api_key now, it cannot be recovered. Append key_hash to TRIPWIRE_ADMIN_KEY_HASHES on the server."
    });
    println!("{}", serde_json::to_string_pretty(&output).unwrap());
    0
}
