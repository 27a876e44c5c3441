//! Record crypto service.
//!
//! Entity-aware wrapper over the field engine used by write and read paths.
//! Rows are JSON objects; only the registry's sensitive fields are touched,
//! other columns pass through untouched. Each row must carry its `id` so
//! ciphertexts bind to the record they live in.

use serde_json::{Map, Value};
use tracing::warn;

use super::engine::{decrypt_field, encrypt_field, FieldContext};
use super::registry::{sensitive_fields, EntityKind};
use crate::keys::Dek;
use crate::types::{DrawbridgeError, Result, UserId};

/// Entity-aware row transformer for the storage paths.
pub struct RecordCrypto;

impl RecordCrypto {
    /// Encrypt the sensitive fields of a row before insert/update.
    ///
    /// Absent and null fields are left alone (partial updates keep their
    /// previous stored value); already-encrypted values are unchanged.
    pub fn encrypt_for_insert(
        kind: EntityKind,
        row: &mut Map<String, Value>,
        user_id: &UserId,
        dek: &Dek,
    ) -> Result<()> {
        let record_id = row_id(row)?;

        for spec in sensitive_fields(kind) {
            let Some(value) = row.get(spec.name) else {
                continue;
            };
            let Some(plaintext) = value.as_str() else {
                continue;
            };

            let ctx = FieldContext {
                kind,
                record_id: &record_id,
                field_name: spec.name,
                user_id,
            };
            let sealed = encrypt_field(plaintext, dek, &ctx)?;
            row.insert(spec.name.to_string(), Value::String(sealed));
        }
        Ok(())
    }

    /// Decrypt the sensitive fields of a single row after select.
    ///
    /// Lazy fields are skipped unless `include_lazy` is set; read them
    /// selectively with [`RecordCrypto::decrypt_lazy_field`].
    pub fn decrypt_row(
        kind: EntityKind,
        row: &mut Map<String, Value>,
        user_id: &UserId,
        dek: &Dek,
        include_lazy: bool,
    ) -> Result<()> {
        let record_id = row_id(row)?;

        for spec in sensitive_fields(kind) {
            if spec.lazy && !include_lazy {
                continue;
            }
            let Some(value) = row.get(spec.name) else {
                continue;
            };
            let Some(stored) = value.as_str() else {
                continue;
            };

            let ctx = FieldContext {
                kind,
                record_id: &record_id,
                field_name: spec.name,
                user_id,
            };
            let plaintext = decrypt_field(stored, dek, &ctx)?;
            row.insert(spec.name.to_string(), Value::String(plaintext));
        }
        Ok(())
    }

    /// Batch-decrypt rows after select. A row that fails is left encrypted
    /// and reported; other rows continue.
    pub fn decrypt_after_select(
        kind: EntityKind,
        rows: &mut [Map<String, Value>],
        user_id: &UserId,
        dek: &Dek,
    ) -> Result<()> {
        let mut first_error = None;
        for row in rows.iter_mut() {
            if let Err(e) = Self::decrypt_row(kind, row, user_id, dek, false) {
                warn!(kind = %kind, error = %e, "Row decryption failed in batch");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Selectively decrypt one lazy field without touching the rest of the
    /// row. Used for large values (private keys, recording payloads).
    pub fn decrypt_lazy_field(
        kind: EntityKind,
        row: &Map<String, Value>,
        field_name: &str,
        user_id: &UserId,
        dek: &Dek,
    ) -> Result<Option<String>> {
        let record_id = row_id(row)?;
        let Some(value) = row.get(field_name).and_then(Value::as_str) else {
            return Ok(None);
        };

        let ctx = FieldContext {
            kind,
            record_id: &record_id,
            field_name,
            user_id,
        };
        decrypt_field(value, dek, &ctx).map(Some)
    }

    /// Re-encrypt a row's sensitive fields from one owner's key to another.
    ///
    /// Used when ownership changes hand (shared-credential materialization,
    /// admin transfer). The target row id may differ from the source row id
    /// when the grantee receives their own shared-view copy.
    #[allow(clippy::too_many_arguments)]
    pub fn reencrypt_on_owner_change(
        kind: EntityKind,
        row: &mut Map<String, Value>,
        from_user: &UserId,
        from_dek: &Dek,
        to_user: &UserId,
        to_dek: &Dek,
        to_record_id: Option<&str>,
    ) -> Result<()> {
        let from_record_id = row_id(row)?;
        let to_record_id = to_record_id.unwrap_or(&from_record_id).to_string();

        for spec in sensitive_fields(kind) {
            let Some(stored) = row.get(spec.name).and_then(Value::as_str) else {
                continue;
            };

            let from_ctx = FieldContext {
                kind,
                record_id: &from_record_id,
                field_name: spec.name,
                user_id: from_user,
            };
            let plaintext = decrypt_field(stored, from_dek, &from_ctx)?;

            let to_ctx = FieldContext {
                kind,
                record_id: &to_record_id,
                field_name: spec.name,
                user_id: to_user,
            };
            let sealed = encrypt_field(&plaintext, to_dek, &to_ctx)?;
            row.insert(spec.name.to_string(), Value::String(sealed));
        }
        Ok(())
    }
}

fn row_id(row: &Map<String, Value>) -> Result<String> {
    row.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DrawbridgeError::CryptoFailed("row is missing its id".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn host_row() -> Map<String, Value> {
        json!({
            "id": "host-1",
            "name": "h1",
            "ip": "10.0.0.1",
            "password": "secret",
            "private_key": "-----BEGIN KEY-----",
            "sudo_password": "root-secret",
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn test_encrypt_for_insert_touches_only_sensitive() {
        let dek = Dek::generate();
        let user = "user-1".to_string();
        let mut row = host_row();

        RecordCrypto::encrypt_for_insert(EntityKind::Host, &mut row, &user, &dek).unwrap();

        assert_eq!(row["name"], "h1");
        assert_eq!(row["ip"], "10.0.0.1");
        assert!(row["password"].as_str().unwrap().starts_with("v1:"));
        assert!(row["private_key"].as_str().unwrap().starts_with("v1:"));
        assert!(!row["password"].as_str().unwrap().contains("secret"));
    }

    #[test]
    fn test_decrypt_after_select_roundtrip() {
        let dek = Dek::generate();
        let user = "user-1".to_string();
        let mut row = host_row();
        RecordCrypto::encrypt_for_insert(EntityKind::Host, &mut row, &user, &dek).unwrap();

        let mut rows = vec![row];
        RecordCrypto::decrypt_after_select(EntityKind::Host, &mut rows, &user, &dek).unwrap();

        assert_eq!(rows[0]["password"], "secret");
        assert_eq!(rows[0]["sudo_password"], "root-secret");
        // Lazy field stays encrypted in bulk reads.
        assert!(rows[0]["private_key"].as_str().unwrap().starts_with("v1:"));
    }

    #[test]
    fn test_lazy_field_selective_decrypt() {
        let dek = Dek::generate();
        let user = "user-1".to_string();
        let mut row = host_row();
        RecordCrypto::encrypt_for_insert(EntityKind::Host, &mut row, &user, &dek).unwrap();

        let key = RecordCrypto::decrypt_lazy_field(EntityKind::Host, &row, "private_key", &user, &dek)
            .unwrap()
            .unwrap();
        assert_eq!(key, "-----BEGIN KEY-----");

        // Absent field reads as None.
        assert!(RecordCrypto::decrypt_lazy_field(
            EntityKind::Host,
            &row,
            "autostart_private_key",
            &user,
            &dek
        )
        .unwrap()
        .is_none());
    }

    #[test]
    fn test_partial_update_leaves_absent_fields() {
        let dek = Dek::generate();
        let user = "user-1".to_string();
        let mut row = json!({"id": "host-1", "name": "renamed"})
            .as_object()
            .unwrap()
            .clone();

        RecordCrypto::encrypt_for_insert(EntityKind::Host, &mut row, &user, &dek).unwrap();
        assert!(!row.contains_key("password"));
        assert_eq!(row["name"], "renamed");
    }

    #[test]
    fn test_null_fields_untouched() {
        let dek = Dek::generate();
        let user = "user-1".to_string();
        let mut row = json!({"id": "host-1", "password": null})
            .as_object()
            .unwrap()
            .clone();

        RecordCrypto::encrypt_for_insert(EntityKind::Host, &mut row, &user, &dek).unwrap();
        assert!(row["password"].is_null());
    }

    #[test]
    fn test_missing_id_rejected() {
        let dek = Dek::generate();
        let user = "user-1".to_string();
        let mut row = json!({"password": "secret"}).as_object().unwrap().clone();
        assert!(RecordCrypto::encrypt_for_insert(EntityKind::Host, &mut row, &user, &dek).is_err());
    }

    #[test]
    fn test_reencrypt_on_owner_change() {
        let from_dek = Dek::generate();
        let to_dek = Dek::generate();
        let from = "alice".to_string();
        let to = "bob".to_string();

        let mut row = json!({"id": "cred-1", "password": "secret"})
            .as_object()
            .unwrap()
            .clone();
        RecordCrypto::encrypt_for_insert(EntityKind::Credential, &mut row, &from, &from_dek)
            .unwrap();

        RecordCrypto::reencrypt_on_owner_change(
            EntityKind::Credential,
            &mut row,
            &from,
            &from_dek,
            &to,
            &to_dek,
            Some("shared-1"),
        )
        .unwrap();

        // Now readable only under bob's key at the shared row id.
        row.insert("id".into(), Value::String("shared-1".into()));
        let mut rows = vec![row];
        RecordCrypto::decrypt_after_select(EntityKind::Credential, &mut rows, &to, &to_dek)
            .unwrap();
        assert_eq!(rows[0]["password"], "secret");
    }

    #[test]
    fn test_batch_continues_past_bad_row() {
        let dek = Dek::generate();
        let other_dek = Dek::generate();
        let user = "user-1".to_string();

        let mut good = json!({"id": "h-1", "password": "ok"})
            .as_object()
            .unwrap()
            .clone();
        RecordCrypto::encrypt_for_insert(EntityKind::Host, &mut good, &user, &dek).unwrap();

        let mut bad = json!({"id": "h-2", "password": "nope"})
            .as_object()
            .unwrap()
            .clone();
        RecordCrypto::encrypt_for_insert(EntityKind::Host, &mut bad, &user, &other_dek).unwrap();

        let mut rows = vec![good, bad];
        let result = RecordCrypto::decrypt_after_select(EntityKind::Host, &mut rows, &user, &dek);

        assert!(result.is_err());
        // The good row was still decrypted.
        assert_eq!(rows[0]["password"], "ok");
        assert!(rows[1]["password"].as_str().unwrap().starts_with("v1:"));
    }
}
