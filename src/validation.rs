//! Input checks applied before anything leaves the process.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::UploadConfig;
use crate::db::{Address, ClientKind, ClientRecord, CreateClientParams, UpdateClientParams};
use crate::error::ValidationError;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern is valid")
});

const TAX_ID_SEPARATORS: &[char] = &['.', '-', '/', ' '];
const MIN_NAME_CHARS: usize = 2;
const MIN_PHONE_DIGITS: usize = 10;
const POSTAL_CODE_DIGITS: usize = 8;

/// Strip separators and check the digit count required by `kind`.
///
/// Returns the bare digits, which is what gets stored.
pub fn normalize_tax_id(kind: ClientKind, raw: &str) -> Result<String, ValidationError> {
    let digits: String = raw
        .trim()
        .chars()
        .filter(|c| !TAX_ID_SEPARATORS.contains(c))
        .collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::TaxIdFormat);
    }
    let expected = kind.tax_id_len();
    if digits.len() != expected {
        return Err(ValidationError::TaxIdLength {
            kind: kind.as_str(),
            expected,
            actual: digits.len(),
        });
    }
    Ok(digits)
}

/// Validate a new client and return it with normalized fields.
pub fn validate_new_client(
    input: &CreateClientParams,
) -> Result<CreateClientParams, ValidationError> {
    Ok(CreateClientParams {
        kind: input.kind,
        legal_name: validate_name(&input.legal_name)?,
        tax_id: normalize_tax_id(input.kind, &input.tax_id)?,
        email: validate_email(&input.email)?,
        phone: validate_phone(&input.phone)?,
        occupation_or_activity: trimmed_opt(input.occupation_or_activity.as_deref()),
        address: validate_address(&input.address)?,
    })
}

/// Validate a partial update against the row it will modify.
///
/// A change to either `kind` or `tax_id` re-checks the pair, taking the
/// untouched half from `current`. Only fields present in `update` are
/// returned, so the store still receives just the changed columns.
pub fn validate_client_update(
    update: &UpdateClientParams,
    current: Option<&ClientRecord>,
) -> Result<UpdateClientParams, ValidationError> {
    let mut out = UpdateClientParams {
        kind: update.kind,
        ..Default::default()
    };

    if update.kind.is_some() || update.tax_id.is_some() {
        let kind = update
            .kind
            .or(current.map(|c| c.kind))
            .ok_or_else(|| ValidationError::InvalidField {
                field: "kind",
                reason: "client kind is unknown".to_string(),
            })?;
        let raw_tax_id = update
            .tax_id
            .as_deref()
            .or(current.map(|c| c.tax_id.as_str()))
            .ok_or_else(|| ValidationError::InvalidField {
                field: "tax_id",
                reason: "tax id is unknown".to_string(),
            })?;
        let normalized = normalize_tax_id(kind, raw_tax_id)?;
        if update.tax_id.is_some() {
            out.tax_id = Some(normalized);
        }
    }

    if let Some(ref name) = update.legal_name {
        out.legal_name = Some(validate_name(name)?);
    }
    if let Some(ref email) = update.email {
        out.email = Some(validate_email(email)?);
    }
    if let Some(ref phone) = update.phone {
        out.phone = Some(validate_phone(phone)?);
    }
    if let Some(ref occupation) = update.occupation_or_activity {
        out.occupation_or_activity = Some(trimmed_opt(occupation.as_deref()));
    }
    if let Some(ref address) = update.address {
        out.address = Some(validate_address(address)?);
    }
    Ok(out)
}

/// Check an incoming file against the upload rules and return its MIME type.
///
/// When the caller does not know the type it is guessed from the file name.
pub fn validate_upload(
    policy: &UploadConfig,
    file_name: &str,
    byte_size: u64,
    declared_mime: Option<&str>,
) -> Result<String, ValidationError> {
    if file_name.trim().is_empty() {
        return Err(ValidationError::InvalidField {
            field: "file_name",
            reason: "file name is required".to_string(),
        });
    }
    if byte_size == 0 {
        return Err(ValidationError::EmptyFile);
    }
    if byte_size > policy.max_bytes {
        return Err(ValidationError::FileTooLarge {
            size: byte_size,
            max: policy.max_bytes,
        });
    }

    let mime = match declared_mime.map(str::trim).filter(|m| !m.is_empty()) {
        Some(m) => m.to_ascii_lowercase(),
        None => mime_guess::from_path(file_name)
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_string(),
    };
    if !policy.allowed_mime_types.iter().any(|allowed| *allowed == mime) {
        return Err(ValidationError::UnsupportedFileType { mime });
    }
    Ok(mime)
}

fn validate_name(raw: &str) -> Result<String, ValidationError> {
    let name = raw.trim();
    if name.chars().count() < MIN_NAME_CHARS {
        return Err(ValidationError::InvalidField {
            field: "legal_name",
            reason: format!("must have at least {MIN_NAME_CHARS} characters"),
        });
    }
    Ok(name.to_string())
}

fn validate_email(raw: &str) -> Result<String, ValidationError> {
    let email = raw.trim();
    if !EMAIL_RE.is_match(email) {
        return Err(ValidationError::InvalidField {
            field: "email",
            reason: format!("'{email}' is not an email address"),
        });
    }
    Ok(email.to_string())
}

fn validate_phone(raw: &str) -> Result<String, ValidationError> {
    let digits = raw.chars().filter(char::is_ascii_digit).count();
    if digits < MIN_PHONE_DIGITS {
        return Err(ValidationError::InvalidField {
            field: "phone",
            reason: format!("must have at least {MIN_PHONE_DIGITS} digits"),
        });
    }
    Ok(raw.trim().to_string())
}

fn validate_address(address: &Address) -> Result<Address, ValidationError> {
    let postal_code: String = address
        .postal_code
        .chars()
        .filter(|c| *c != '-' && *c != ' ')
        .collect();
    if postal_code.len() != POSTAL_CODE_DIGITS || !postal_code.chars().all(|c| c.is_ascii_digit())
    {
        return Err(ValidationError::InvalidField {
            field: "postal_code",
            reason: format!("must have {POSTAL_CODE_DIGITS} digits"),
        });
    }

    let required = [
        ("street", &address.street),
        ("number", &address.number),
        ("district", &address.district),
        ("city", &address.city),
        ("region", &address.region),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(ValidationError::InvalidField {
                field,
                reason: "is required".to_string(),
            });
        }
    }

    Ok(Address {
        postal_code,
        street: address.street.trim().to_string(),
        number: address.number.trim().to_string(),
        complement: trimmed_opt(address.complement.as_deref()),
        district: address.district.trim().to_string(),
        city: address.city.trim().to_string(),
        region: address.region.trim().to_string(),
    })
}

fn trimmed_opt(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn tax_id_length_depends_on_kind() {
        assert_eq!(
            normalize_tax_id(ClientKind::Individual, "123.456.789-01").expect("cpf"),
            "12345678901"
        );
        assert_eq!(
            normalize_tax_id(ClientKind::Organization, "12.345.678/0001-90").expect("cnpj"),
            "12345678000190"
        );

        let err = normalize_tax_id(ClientKind::Organization, "123.456.789-01")
            .expect_err("11 digits is not an organization id");
        assert_eq!(
            err,
            ValidationError::TaxIdLength {
                kind: "organization",
                expected: 14,
                actual: 11,
            }
        );
    }

    #[test]
    fn tax_id_rejects_letters() {
        assert_eq!(
            normalize_tax_id(ClientKind::Individual, "1234567890A"),
            Err(ValidationError::TaxIdFormat)
        );
    }

    #[test]
    fn new_client_is_normalized() {
        let client = validate_new_client(&individual("  Ana Souza ")).expect("valid");
        assert_eq!(client.legal_name, "Ana Souza");
        assert_eq!(client.tax_id, "12345678901");
        assert_eq!(client.address.postal_code, "01310100");
    }

    #[test]
    fn new_client_rejects_bad_email_and_short_phone() {
        let mut input = organization("Acme Ltda");
        input.email = "not-an-email".to_string();
        assert!(matches!(
            validate_new_client(&input),
            Err(ValidationError::InvalidField { field: "email", .. })
        ));

        let mut input = organization("Acme Ltda");
        input.phone = "1234".to_string();
        assert!(matches!(
            validate_new_client(&input),
            Err(ValidationError::InvalidField { field: "phone", .. })
        ));
    }

    #[test]
    fn new_client_requires_address_fields() {
        let mut input = individual("Ana Souza");
        input.address.city = "  ".to_string();
        assert!(matches!(
            validate_new_client(&input),
            Err(ValidationError::InvalidField { field: "city", .. })
        ));
    }

    #[test]
    fn update_rechecks_existing_tax_id_when_kind_changes() {
        let created = validate_new_client(&individual("Ana Souza")).expect("valid");
        let now = chrono::Utc::now();
        let current = ClientRecord {
            id: uuid::Uuid::new_v4(),
            kind: created.kind,
            legal_name: created.legal_name,
            tax_id: created.tax_id,
            email: created.email,
            phone: created.phone,
            occupation_or_activity: None,
            address: created.address,
            created_by: uuid::Uuid::new_v4(),
            created_at: now,
            updated_at: now,
        };

        let kind_only = UpdateClientParams {
            kind: Some(ClientKind::Organization),
            ..Default::default()
        };
        assert!(matches!(
            validate_client_update(&kind_only, Some(&current)),
            Err(ValidationError::TaxIdLength { expected: 14, .. })
        ));

        let both = UpdateClientParams {
            kind: Some(ClientKind::Organization),
            tax_id: Some("12.345.678/0001-90".to_string()),
            ..Default::default()
        };
        let out = validate_client_update(&both, Some(&current)).expect("valid pair");
        assert_eq!(out.tax_id.as_deref(), Some("12345678000190"));
        assert_eq!(out.email, None);
    }

    #[test]
    fn upload_enforces_ceiling_and_type() {
        let policy = UploadConfig::default();

        assert_eq!(
            validate_upload(&policy, "contract.pdf", 2 * 1024 * 1024, None).expect("pdf"),
            "application/pdf"
        );
        assert!(matches!(
            validate_upload(&policy, "contract.pdf", policy.max_bytes + 1, None),
            Err(ValidationError::FileTooLarge { .. })
        ));
        assert!(matches!(
            validate_upload(&policy, "payload.exe", 10, None),
            Err(ValidationError::UnsupportedFileType { .. })
        ));
        assert_eq!(
            validate_upload(&policy, "scan.bin", 10, Some("IMAGE/PNG")).expect("declared"),
            "image/png"
        );
        assert_eq!(
            validate_upload(&policy, "empty.pdf", 0, None),
            Err(ValidationError::EmptyFile)
        );
    }
}
