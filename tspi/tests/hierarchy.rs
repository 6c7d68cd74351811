// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Key hierarchy resolution across contexts sharing one device

use std::path::Path;

use tspi::sim::SimulatedTpm;
use tspi::{
    ps_flag, tpm_rc, Context, ContextConfig, Error, ErrorKind, KeyFlags, KeyHandle, KeyRef,
    KeyUuid, PolicyHandle, PolicyTarget, PolicyUsage, PsType, Resolution, SecretMode,
};

fn file_config(dir: &Path) -> ContextConfig {
    ContextConfig {
        system_ps_path: Some(dir.join("system.json")),
        user_ps_path: Some(dir.join("user.json")),
        ..ContextConfig::default()
    }
}

fn open(sim: &SimulatedTpm, config: ContextConfig) -> Context {
    let mut ctx = Context::with_device(sim.clone(), config).expect("Failed to open context");
    ctx.set_srk_secret_well_known().unwrap();
    ctx
}

fn secret_policy(ctx: &mut Context, secret: &[u8]) -> PolicyHandle {
    let policy = ctx.create_policy(PolicyUsage::Usage);
    ctx.set_secret(policy, SecretMode::Plain, secret).unwrap();
    policy
}

fn create(ctx: &mut Context, flags: KeyFlags, parent: KeyHandle) -> KeyHandle {
    let key = ctx.create_key_object(flags);
    ctx.create_key(key, parent).expect("Failed to create key");
    key
}

/// SRK -> A (secret "alpha") -> B -> C, registered in user storage
fn register_chain(ctx: &mut Context) -> [KeyUuid; 3] {
    let uuids = [KeyUuid::random(), KeyUuid::random(), KeyUuid::random()];
    let srk = ctx.srk();

    let alpha = secret_policy(ctx, b"alpha");
    let a = ctx.create_key_object(KeyFlags::storage().with_authorization(true));
    ctx.assign_policy(alpha, PolicyTarget::Key(a)).unwrap();
    ctx.create_key(a, srk).unwrap();
    ctx.register_key(a, PsType::User, uuids[0], PsType::System, KeyUuid::SRK)
        .unwrap();
    ctx.load_key(a, srk).unwrap();

    let b = create(ctx, KeyFlags::storage(), a);
    ctx.register_key(b, PsType::User, uuids[1], PsType::User, uuids[0])
        .unwrap();
    ctx.load_key(b, a).unwrap();

    let c = create(ctx, KeyFlags::signing(), b);
    ctx.register_key(c, PsType::User, uuids[2], PsType::User, uuids[1])
        .unwrap();
    uuids
}

#[test]
fn test_load_chain_pauses_for_missing_secret() {
    let dir = tempfile::tempdir().unwrap();
    let sim = SimulatedTpm::new();
    let uuids = {
        let mut ctx = open(&sim, file_config(dir.path()));
        let uuids = register_chain(&mut ctx);
        ctx.close().unwrap();
        uuids
    };
    assert_eq!(sim.loaded_key_count(), 0);

    let mut ctx = open(&sim, file_config(dir.path()));
    let challenge = match ctx.load_key_by_uuid(PsType::User, uuids[2]).unwrap() {
        Resolution::NeedsAuth(challenge) => challenge,
        other => panic!("expected a challenge, got {other:?}"),
    };
    assert_eq!(challenge.uuid(), Some(uuids[0]));
    assert_eq!(challenge.ps_type(), Some(PsType::User));
    // A was loaded before the walk stopped
    assert!(ctx.is_loaded(challenge.key()).unwrap());
    assert_eq!(sim.loaded_key_count(), 1);

    let alpha = secret_policy(&mut ctx, b"alpha");
    ctx.supply_auth(&challenge, alpha).unwrap();
    let c = ctx
        .load_key_by_uuid(PsType::User, uuids[2])
        .unwrap()
        .into_loaded()
        .unwrap();
    assert_eq!(sim.loaded_key_count(), 3);

    let before = sim.command_count();
    let again = ctx.load(KeyRef::Uuid(PsType::User, uuids[2])).unwrap();
    assert_eq!(again, Resolution::Loaded(c));
    assert_eq!(sim.command_count(), before);
}

#[test]
fn test_wrong_secret_is_device_failure() {
    let dir = tempfile::tempdir().unwrap();
    let sim = SimulatedTpm::new();
    let uuids = {
        let mut ctx = open(&sim, file_config(dir.path()));
        register_chain(&mut ctx)
    };

    let mut ctx = open(&sim, file_config(dir.path()));
    let Resolution::NeedsAuth(challenge) = ctx.load_key_by_uuid(PsType::User, uuids[1]).unwrap()
    else {
        panic!("expected a challenge");
    };
    let wrong = secret_policy(&mut ctx, b"not alpha");
    ctx.supply_auth(&challenge, wrong).unwrap();
    let err = ctx.load_key_by_uuid(PsType::User, uuids[1]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceError);
    assert_eq!(err.code(), Some(tpm_rc::AUTHFAIL));
}

#[test]
fn test_unregister_requires_output_slot() {
    let sim = SimulatedTpm::new();
    let mut ctx = open(&sim, ContextConfig::default());
    let srk = ctx.srk();
    let key = create(&mut ctx, KeyFlags::bind(), srk);
    let uuid = KeyUuid::random();
    ctx.register_key(key, ps_flag::USER, uuid, ps_flag::SYSTEM, KeyUuid::SRK)
        .unwrap();

    let err = ctx.unregister_key(PsType::User, uuid, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadParameter);
    assert!(ctx.registered_keys(PsType::User).unwrap().len() == 1);

    let mut out = None;
    ctx.unregister_key(PsType::User, uuid, Some(&mut out)).unwrap();
    assert_eq!(out, Some(key));
    assert_eq!(ctx.key_uuid(key).unwrap(), None);

    let err = ctx.load_key_by_uuid(PsType::User, uuid).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);
    assert!(matches!(err, Error::NotRegistered { .. }));
}

#[test]
fn test_find_by_public_info() {
    let sim = SimulatedTpm::new();
    let mut ctx = open(&sim, ContextConfig::default());
    let srk = ctx.srk();
    let key = create(&mut ctx, KeyFlags::signing(), srk);
    let uuid = KeyUuid::random();
    ctx.register_key(key, PsType::User, uuid, PsType::System, KeyUuid::SRK)
        .unwrap();
    let public = ctx.public_key(key).unwrap();

    let err = ctx
        .find_by_public_info(ps_flag::USER | ps_flag::SYSTEM, &public)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadParameter);

    assert_eq!(
        ctx.find_by_public_info(ps_flag::USER, &public).unwrap(),
        Some(key)
    );
    assert_eq!(ctx.find_by_public_info(PsType::System, &public).unwrap(), None);
}

#[test]
fn test_change_auth_replaces_stored_blob() {
    let dir = tempfile::tempdir().unwrap();
    let sim = SimulatedTpm::new();
    let uuid = KeyUuid::random();
    {
        let mut ctx = open(&sim, file_config(dir.path()));
        let srk = ctx.srk();
        let old = secret_policy(&mut ctx, b"old");
        let key = ctx.create_key_object(KeyFlags::storage().with_authorization(true));
        ctx.assign_policy(old, PolicyTarget::Key(key)).unwrap();
        ctx.create_key(key, srk).unwrap();
        ctx.register_key(key, PsType::User, uuid, PsType::System, KeyUuid::SRK)
            .unwrap();
        ctx.load_key(key, srk).unwrap();
        let old_blob = ctx.key_blob(key).unwrap();

        let new = secret_policy(&mut ctx, b"new");
        ctx.change_auth(key, srk, new).unwrap();
        assert_ne!(ctx.key_blob(key).unwrap(), old_blob);
        assert!(ctx.is_loaded(key).unwrap());
        assert_eq!(ctx.policy_of(PolicyTarget::Key(key)).unwrap(), Some(new));
        create(&mut ctx, KeyFlags::bind(), key);
        ctx.close().unwrap();
    }

    let mut ctx = open(&sim, file_config(dir.path()));
    let key = ctx
        .load_key_by_uuid(PsType::User, uuid)
        .unwrap()
        .into_loaded()
        .unwrap();
    let old = secret_policy(&mut ctx, b"old");
    ctx.assign_policy(old, PolicyTarget::Key(key)).unwrap();
    let child = ctx.create_key_object(KeyFlags::bind());
    let err = ctx.create_key(child, key).unwrap_err();
    assert_eq!(err.code(), Some(tpm_rc::AUTHFAIL));

    let new = secret_policy(&mut ctx, b"new");
    ctx.assign_policy(new, PolicyTarget::Key(key)).unwrap();
    ctx.create_key(child, key).unwrap();
}

#[test]
fn test_registrations_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let sim = SimulatedTpm::new();
    let uuid = KeyUuid::random();
    {
        let mut ctx = open(&sim, file_config(dir.path()));
        let srk = ctx.srk();
        let key = create(&mut ctx, KeyFlags::storage(), srk);
        ctx.register_key(key, PsType::System, uuid, PsType::System, KeyUuid::SRK)
            .unwrap();
    }
    assert!(dir.path().join("system.json").exists());

    let mut ctx = open(&sim, file_config(dir.path()));
    let infos = ctx.registered_keys(PsType::System).unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].uuid, uuid);
    assert_eq!(infos[0].parent, KeyUuid::SRK);
    assert!(ctx.registered_keys(PsType::User).unwrap().is_empty());

    let key = ctx
        .load_key_by_uuid(PsType::System, uuid)
        .unwrap()
        .into_loaded()
        .unwrap();
    let child = create(&mut ctx, KeyFlags::signing(), key);
    let err = ctx
        .register_key(child, PsType::System, uuid, PsType::System, KeyUuid::SRK)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyRegistered);
    assert_eq!(
        ctx.get_registered_key_by_uuid(PsType::System, uuid).unwrap(),
        key
    );
}
