// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Family lifecycle and the owner delegate table

use tspi::sim::{SimConfig, SimulatedTpm};
use tspi::{
    derive_auth, tpm_rc, Context, ContextConfig, DelegateScope, DelegationTarget, Error,
    ErrorKind, KeyFlags, PolicyHandle, PolicyUsage, SecretMode,
};

const OWNER: &[u8] = b"owner";

fn device(family_rows: u32) -> SimulatedTpm {
    SimulatedTpm::with_config(SimConfig {
        owner_auth: derive_auth(SecretMode::Plain, OWNER).unwrap(),
        family_rows,
        ..SimConfig::default()
    })
}

fn open(sim: &SimulatedTpm) -> Context {
    let mut ctx = Context::with_device(sim.clone(), ContextConfig::default())
        .expect("Failed to open context");
    ctx.set_srk_secret_well_known().unwrap();
    let owner = ctx.owner_policy();
    ctx.set_secret(owner, SecretMode::Plain, OWNER).unwrap();
    ctx
}

fn delegate_policy(ctx: &mut Context, secret: &[u8]) -> PolicyHandle {
    let policy = ctx.create_policy(PolicyUsage::Usage);
    ctx.set_secret(policy, SecretMode::Plain, secret).unwrap();
    policy
}

#[test]
fn test_cache_respects_occupied_rows() {
    let sim = device(8);
    let mut ctx = open(&sim);
    let policy = delegate_policy(&mut ctx, b"operator");
    let family = ctx.create_family(1).unwrap();
    ctx.set_family_state(family, true).unwrap();

    let first = ctx
        .create_delegation(family, policy, DelegationTarget::Owner, 0x1, 0)
        .unwrap();
    let second = ctx
        .create_delegation(family, policy, DelegationTarget::Owner, 0x2, 0)
        .unwrap();
    assert_eq!(ctx.policy_delegation(policy).unwrap(), Some(second.clone()));

    ctx.cache(0, &first, false).unwrap();
    let err = ctx.cache(0, &second, false).unwrap_err();
    assert!(matches!(err, Error::RowOccupied { row: 0 }));
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert_eq!(ctx.read_tables().unwrap().row(0).unwrap().public.per1, 0x1);

    ctx.cache(0, &second, true).unwrap();
    assert_eq!(ctx.read_tables().unwrap().row(0).unwrap().public.per1, 0x2);

    let err = ctx.cache(2, &first, true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadParameter);
    ctx.invalidate(family).unwrap();
}

#[test]
fn test_family_pool_exhaustion() {
    let sim = device(2);
    let mut ctx = open(&sim);
    assert_eq!(ctx.delegation_capacity().unwrap().family_rows, 2);

    let a = ctx.create_family(1).unwrap();
    let _b = ctx.create_family(2).unwrap();
    let err = ctx.create_family(3).unwrap_err();
    assert!(matches!(err, Error::NoFreeFamilySlot));
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

    ctx.invalidate(a).unwrap();
    assert!(!ctx.family_valid(a).unwrap());
    // Already invalid: no effect
    ctx.invalidate(a).unwrap();

    let c = ctx.create_family(3).unwrap();
    assert_eq!(ctx.family_label(c).unwrap(), 3);
    assert_eq!(sim.live_family_count(), 2);
}

#[test]
fn test_with_family_invalidates_on_error() {
    let sim = device(8);
    let mut ctx = open(&sim);
    let policy = delegate_policy(&mut ctx, b"operator");

    // Delegating from a disabled family fails on the device
    let err = ctx
        .with_family(9, |ctx, family| {
            assert!(!ctx.family_enabled(family)?);
            ctx.create_delegation(family, policy, DelegationTarget::Owner, 0x1, 0)
        })
        .unwrap_err();
    assert_eq!(err.code(), Some(tpm_rc::DELEGATE_FAMILY));
    assert_eq!(sim.live_family_count(), 0);

    let label = ctx.with_family(9, |ctx, family| ctx.family_label(family)).unwrap();
    assert_eq!(label, 9);
    assert_eq!(sim.live_family_count(), 0);
}

#[test]
fn test_labels_unique_among_live_families() {
    let sim = device(8);
    let mut ctx = open(&sim);
    let family = ctx.create_family(5).unwrap();
    let err = ctx.create_family(5).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadParameter);
    ctx.invalidate(family).unwrap();
    ctx.create_family(5).unwrap();
}

#[test]
fn test_owner_secret_required() {
    let sim = device(8);
    let mut ctx = Context::with_device(sim.clone(), ContextConfig::default()).unwrap();
    let err = ctx.create_family(1).unwrap_err();
    assert!(matches!(err, Error::OwnerAuthRequired));
    assert_eq!(err.kind(), ErrorKind::AuthorizationRequired);

    let owner = ctx.owner_policy();
    ctx.set_secret(owner, SecretMode::Plain, b"wrong owner")
        .unwrap();
    let err = ctx.create_family(1).unwrap_err();
    assert_eq!(err.code(), Some(tpm_rc::AUTHFAIL));
    assert_eq!(sim.live_family_count(), 0);
}

#[test]
fn test_key_delegation_is_not_cached() {
    let sim = device(8);
    let mut ctx = open(&sim);
    let srk = ctx.srk();
    let key = ctx.create_key_object(KeyFlags::signing());
    ctx.create_key(key, srk).unwrap();
    ctx.load_key(key, srk).unwrap();
    let policy = delegate_policy(&mut ctx, b"signer");

    ctx.with_family(2, |ctx, family| {
        ctx.set_family_state(family, true)?;
        let blob =
            ctx.create_delegation(family, policy, DelegationTarget::Key(key), 0x4, 0)?;
        assert_eq!(blob.scope(), DelegateScope::Key);
        assert_eq!(blob.family_id(), ctx.family_id(family)?);

        let err = ctx.cache(0, &blob, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadParameter);
        Ok(())
    })
    .unwrap();
    assert!(sim.occupied_delegate_rows().is_empty());
}
