// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Service provider walkthrough
//!
//! Runs the core flows against the in-process simulated device.
//!
//! Usage:
//!   tspi-demo [command]
//!
//! Commands:
//!   hierarchy   - Register a key chain and load it through an auth challenge
//!   transport   - Run commands inside a wrapped and signed transport session
//!   delegation  - Create a family, delegate owner auth and cache it
//!   blob        - Encode and decode a blob envelope
//!   all         - Run everything

use std::env;

use anyhow::{bail, Context as _, Result};
use tspi::sim::{SimConfig, SimulatedTpm};
use tspi::{
    blob, derive_auth, BlobType, Context, ContextConfig, DelegationTarget, Error, KeyFlags,
    KeyRef, KeyUuid, PolicyTarget, PolicyUsage, PsType, Resolution, SecretMode,
};

const OWNER_SECRET: &[u8] = b"demo owner";

fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).init();
    }

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("all");

    let device = SimulatedTpm::with_config(SimConfig {
        owner_auth: derive_auth(SecretMode::Plain, OWNER_SECRET)?,
        ..SimConfig::default()
    });

    match command {
        "hierarchy" => demo_hierarchy(&device)?,
        "transport" => demo_transport(&device)?,
        "delegation" => demo_delegation(&device)?,
        "blob" => demo_blob()?,
        "all" => {
            demo_hierarchy(&device)?;
            demo_transport(&device)?;
            demo_delegation(&device)?;
            demo_blob()?;
        }
        other => bail!(
            "unknown command: {other} (available: hierarchy, transport, delegation, blob, all)"
        ),
    }
    println!("device handled {} commands", device.command_count());
    Ok(())
}

fn open(device: &SimulatedTpm) -> Result<Context> {
    open_with(device, ContextConfig::default())
}

fn open_with(device: &SimulatedTpm, config: ContextConfig) -> Result<Context> {
    let mut ctx = Context::with_device(device.clone(), config)
        .context("failed to open context")?;
    ctx.set_srk_secret_well_known()?;
    let owner = ctx.owner_policy();
    ctx.set_secret(owner, SecretMode::Plain, OWNER_SECRET)?;
    Ok(ctx)
}

fn demo_hierarchy(device: &SimulatedTpm) -> Result<()> {
    println!("--- key hierarchy ---");
    let storage = tempfile::tempdir().context("failed to create storage directory")?;
    let config = ContextConfig {
        system_ps_path: Some(storage.path().join("system.json")),
        user_ps_path: Some(storage.path().join("user.json")),
        ..ContextConfig::default()
    };
    let parent_uuid = KeyUuid::random();
    let child_uuid = KeyUuid::random();

    {
        let mut ctx = open_with(device, config.clone())?;
        let secret = ctx.create_policy(PolicyUsage::Usage);
        ctx.set_secret(secret, SecretMode::Plain, b"parent secret")?;

        let parent = ctx.create_key_object(KeyFlags::storage().with_authorization(true));
        ctx.assign_policy(secret, PolicyTarget::Key(parent))?;
        ctx.create_key(parent, ctx.srk())?;
        ctx.register_key(parent, PsType::User, parent_uuid, PsType::System, KeyUuid::SRK)?;
        ctx.load(KeyRef::Handle(parent))?.into_loaded()?;

        let child = ctx.create_key_object(KeyFlags::signing());
        ctx.create_key(child, parent)?;
        ctx.register_key(child, PsType::User, child_uuid, PsType::User, parent_uuid)?;
        println!("registered {parent_uuid} and child {child_uuid}");
        ctx.close()?;
    }

    // A fresh context knows the chain only from storage
    let mut ctx = open_with(device, config)?;
    let challenge = match ctx.load_key_by_uuid(PsType::User, child_uuid)? {
        Resolution::NeedsAuth(challenge) => challenge,
        Resolution::Loaded(_) => bail!("parent secret was not requested"),
    };
    println!("load paused: {challenge}");

    let secret = ctx.create_policy(PolicyUsage::Usage);
    ctx.set_secret(secret, SecretMode::Plain, b"parent secret")?;
    ctx.supply_auth(&challenge, secret)?;
    let child = ctx.load_key_by_uuid(PsType::User, child_uuid)?.into_loaded()?;
    println!(
        "loaded child: {} byte public key",
        ctx.public_key(child)?.len()
    );
    ctx.close()?;
    Ok(())
}

fn demo_transport(device: &SimulatedTpm) -> Result<()> {
    println!("--- transport session ---");
    let mut ctx = open(device)?;
    let session = ctx.begin_transport(true, true)?;

    let key = ctx.create_key_object(KeyFlags::bind());
    ctx.create_key(key, ctx.srk())?;
    ctx.load_key(key, ctx.srk())?;
    let capacity = ctx.delegation_capacity()?;
    println!("inside the session: {capacity:?}");

    let receipt = ctx.finalize_transport(session)?;
    println!(
        "released after {} commands, log {}, {} byte signature",
        receipt.commands,
        hex::encode(receipt.digest),
        receipt.signature.len()
    );
    ctx.close()?;
    Ok(())
}

fn demo_delegation(device: &SimulatedTpm) -> Result<()> {
    println!("--- owner delegation ---");
    let mut ctx = open(device)?;
    let delegate = ctx.create_policy(PolicyUsage::Usage);
    ctx.set_secret(delegate, SecretMode::Plain, b"operator")?;

    let row = ctx.with_family(7, |ctx, family| {
        ctx.set_family_state(family, true)?;
        let blob = ctx.create_delegation(family, delegate, DelegationTarget::Owner, 0x1, 0)?;
        match ctx.cache(0, &blob, false) {
            Ok(()) => {}
            Err(Error::RowOccupied { row }) => {
                println!("row {row} occupied, overwriting");
                ctx.cache(0, &blob, true)?;
            }
            Err(e) => return Err(e),
        }
        let tables = ctx.read_tables()?;
        Ok(tables.row(0).copied())
    })?;
    println!("row 0 while the family was live: {row:?}");
    println!("live families afterwards: {}", device.live_family_count());
    ctx.close()?;
    Ok(())
}

fn demo_blob() -> Result<()> {
    println!("--- blob envelope ---");
    let raw = b"sealed application data";
    let encoded = blob::encode_to_vec(raw, BlobType::SealedData);
    let (blob_type, decoded) = blob::decode_to_vec(&encoded)?;
    println!(
        "{} raw bytes -> {} encoded bytes ({blob_type:?})",
        raw.len(),
        encoded.len()
    );
    if decoded != raw {
        bail!("blob round trip changed the data");
    }
    Ok(())
}
