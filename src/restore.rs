// Bulk restore reducers for disaster recovery
// Accept JSON arrays exported from the admin panel (TypeScript SDK format)

use spacetimedb::{reducer, ReducerContext, Timestamp, log, Table};
use crate::{Profile, WalletTransaction, WithdrawalRequest, TxKind, WithdrawalStatus, authorized_worker};
use crate::{profile, wallet_transaction, withdrawal_request};
use serde_json::Value;

/// Parse Timestamp from SDK JSON format: {"__timestamp_micros_since_unix_epoch__": "123456"}
/// Older exports carry plain RFC 3339 strings instead; accept both.
pub(crate) fn parse_timestamp_json(val: &Value) -> Result<Timestamp, String> {
    if let Some(micros_str) = val
        .get("__timestamp_micros_since_unix_epoch__")
        .and_then(|v| v.as_str())
    {
        let micros: i64 = micros_str
            .parse()
            .map_err(|e| format!("Invalid timestamp micros: {}", e))?;
        return Ok(Timestamp::from_micros_since_unix_epoch(micros));
    }

    if let Some(s) = val.as_str() {
        let dt = chrono::DateTime::parse_from_rfc3339(s)
            .map_err(|e| format!("Invalid RFC 3339 timestamp '{}': {}", s, e))?;
        return Ok(Timestamp::from_micros_since_unix_epoch(dt.timestamp_micros()));
    }

    Err("Missing or invalid timestamp field".to_string())
}

/// Parse a ledger entry kind from its wire name
pub(crate) fn parse_tx_kind(s: &str) -> Result<TxKind, String> {
    match s {
        "game_reward" => Ok(TxKind::GameReward),
        "referral_bonus" => Ok(TxKind::ReferralBonus),
        "withdrawal" => Ok(TxKind::Withdrawal),
        other => Err(format!("Unknown transaction kind: {}", other)),
    }
}

/// Parse a withdrawal status from its wire name
pub(crate) fn parse_withdrawal_status(s: &str) -> Result<WithdrawalStatus, String> {
    match s {
        "pending" => Ok(WithdrawalStatus::Pending),
        "approved" => Ok(WithdrawalStatus::Approved),
        "rejected" => Ok(WithdrawalStatus::Rejected),
        other => Err(format!("Unknown withdrawal status: {}", other)),
    }
}

/// Bulk restore profile table from JSON array
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn bulk_restore_profile(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    // Authorization check: only authorized workers can restore data
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        log::warn!("Unauthorized bulk_restore_profile attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let data: Value = serde_json::from_str(&json_data)
        .map_err(|e| format!("Invalid JSON: {}", e))?;

    let profiles = data.as_array()
        .ok_or("Expected JSON array of profiles")?;

    let mut count = 0;
    for (i, p) in profiles.iter().enumerate() {
        let profile = Profile {
            id: p.get("id").and_then(|v| v.as_str()).ok_or(format!("Profile {}: missing id", i))?.to_string(),
            display_name: p.get("displayName").and_then(|v| v.as_str()).ok_or(format!("Profile {}: missing displayName", i))?.to_string(),
            balance_units: p.get("balanceUnits").and_then(|v| v.as_i64()).ok_or(format!("Profile {}: missing balanceUnits", i))?,
            vip_level: p.get("vipLevel").and_then(|v| v.as_u64()).ok_or(format!("Profile {}: missing vipLevel", i))? as u8,
            total_solved: p.get("totalSolved").and_then(|v| v.as_u64()).ok_or(format!("Profile {}: missing totalSolved", i))? as u32,
            referral_code: p.get("referralCode").and_then(|v| v.as_str()).ok_or(format!("Profile {}: missing referralCode", i))?.to_string(),
            referred_by: p.get("referredBy").and_then(|v| v.as_str()).map(|s| s.to_string()),
            created_at: parse_timestamp_json(p.get("createdAt").ok_or(format!("Profile {}: missing createdAt", i))?)?,
            last_seen: parse_timestamp_json(p.get("lastSeen").ok_or(format!("Profile {}: missing lastSeen", i))?)?,
        };

        ctx.db.profile().insert(profile);
        count += 1;
    }

    log::info!("✅ Restored {} profile records", count);
    Ok(())
}

/// Bulk restore wallet_transaction table from JSON array
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn bulk_restore_wallet_transaction(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    // Authorization check: only authorized workers can restore data
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        log::warn!("Unauthorized bulk_restore_wallet_transaction attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let data: Value = serde_json::from_str(&json_data)
        .map_err(|e| format!("Invalid JSON: {}", e))?;

    let entries = data.as_array()
        .ok_or("Expected JSON array of wallet_transaction records")?;

    let mut count = 0;
    for (i, t) in entries.iter().enumerate() {
        let tx = WalletTransaction {
            id: 0, // auto_inc
            user_id: t.get("userId").and_then(|v| v.as_str()).ok_or(format!("Tx {}: missing userId", i))?.to_string(),
            amount_units: t.get("amountUnits").and_then(|v| v.as_i64()).ok_or(format!("Tx {}: missing amountUnits", i))?,
            kind: parse_tx_kind(t.get("kind").and_then(|v| v.as_str()).ok_or(format!("Tx {}: missing kind", i))?)?,
            created_at: parse_timestamp_json(t.get("createdAt").ok_or(format!("Tx {}: missing createdAt", i))?)?,
        };

        ctx.db.wallet_transaction().insert(tx);
        count += 1;
    }

    log::info!("✅ Restored {} wallet_transaction records", count);
    Ok(())
}

/// Bulk restore withdrawal_request table from JSON array
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn bulk_restore_withdrawal_request(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    // Authorization check: only authorized workers can restore data
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        log::warn!("Unauthorized bulk_restore_withdrawal_request attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let data: Value = serde_json::from_str(&json_data)
        .map_err(|e| format!("Invalid JSON: {}", e))?;

    let requests = data.as_array()
        .ok_or("Expected JSON array of withdrawal_request records")?;

    let mut count = 0;
    for (i, w) in requests.iter().enumerate() {
        let request = WithdrawalRequest {
            id: 0, // auto_inc
            user_id: w.get("userId").and_then(|v| v.as_str()).ok_or(format!("Request {}: missing userId", i))?.to_string(),
            amount_units: w.get("amountUnits").and_then(|v| v.as_i64()).ok_or(format!("Request {}: missing amountUnits", i))?,
            wallet_address: w.get("walletAddress").and_then(|v| v.as_str()).ok_or(format!("Request {}: missing walletAddress", i))?.to_string(),
            method: w.get("method").and_then(|v| v.as_str()).unwrap_or("USDT-Binance").to_string(),
            status: parse_withdrawal_status(w.get("status").and_then(|v| v.as_str()).ok_or(format!("Request {}: missing status", i))?)?,
            created_at: parse_timestamp_json(w.get("createdAt").ok_or(format!("Request {}: missing createdAt", i))?)?,
        };

        ctx.db.withdrawal_request().insert(request);
        count += 1;
    }

    log::info!("✅ Restored {} withdrawal_request records", count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timestamp_parses_sdk_micros_object() {
        let val = json!({"__timestamp_micros_since_unix_epoch__": "1700000000000000"});
        let ts = parse_timestamp_json(&val).unwrap();
        assert_eq!(ts.to_micros_since_unix_epoch(), 1_700_000_000_000_000);
    }

    #[test]
    fn timestamp_parses_rfc3339_string() {
        let val = json!("1970-01-01T00:00:01Z");
        let ts = parse_timestamp_json(&val).unwrap();
        assert_eq!(ts.to_micros_since_unix_epoch(), 1_000_000);
    }

    #[test]
    fn timestamp_rejects_garbage() {
        assert!(parse_timestamp_json(&json!(42)).is_err());
        assert!(parse_timestamp_json(&json!("not a date")).is_err());
        assert!(parse_timestamp_json(&json!({"wrong_key": "1"})).is_err());
    }

    #[test]
    fn wire_names_round_trip() {
        assert_eq!(parse_tx_kind("game_reward").unwrap(), TxKind::GameReward);
        assert_eq!(parse_tx_kind("referral_bonus").unwrap(), TxKind::ReferralBonus);
        assert_eq!(parse_tx_kind("withdrawal").unwrap(), TxKind::Withdrawal);
        assert!(parse_tx_kind("jackpot").is_err());

        assert_eq!(parse_withdrawal_status("pending").unwrap(), WithdrawalStatus::Pending);
        assert_eq!(parse_withdrawal_status("approved").unwrap(), WithdrawalStatus::Approved);
        assert_eq!(parse_withdrawal_status("rejected").unwrap(), WithdrawalStatus::Rejected);
        assert!(parse_withdrawal_status("cancelled").is_err());
    }
}
