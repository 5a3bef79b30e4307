//! Summaries derived from the registry snapshots on demand.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::db::{ClientKind, ClientRecord, DocumentRecord, DocumentStatus};

const RECENT_CLIENTS: usize = 5;
const MAX_WINDOW_DAYS: i64 = 36_500;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSummary {
    pub total_clients: usize,
    pub total_documents: usize,
    pub window_days: i64,
    pub new_clients: usize,
    pub new_documents: usize,
    pub clients_by_kind: Vec<(ClientKind, usize)>,
    pub documents_by_status: Vec<(DocumentStatus, usize)>,
    /// Documents without a file are not counted.
    pub mime_types: BTreeMap<String, usize>,
    pub recent_clients: Vec<ClientRecord>,
}

impl ReportSummary {
    pub fn build(
        clients: &[ClientRecord],
        documents: &[DocumentRecord],
        window_days: i64,
        now: DateTime<Utc>,
    ) -> Self {
        let since = now - Duration::days(window_days.clamp(0, MAX_WINDOW_DAYS));

        let clients_by_kind = [ClientKind::Individual, ClientKind::Organization]
            .into_iter()
            .map(|kind| (kind, clients.iter().filter(|c| c.kind == kind).count()))
            .collect();
        let documents_by_status = DocumentStatus::ALL
            .into_iter()
            .map(|status| {
                (
                    status,
                    documents.iter().filter(|d| d.status == status).count(),
                )
            })
            .collect();

        let mut mime_types = BTreeMap::new();
        for file in documents.iter().filter_map(|d| d.file.as_ref()) {
            *mime_types.entry(file.mime_type.clone()).or_insert(0) += 1;
        }

        let mut recent_clients = clients.to_vec();
        recent_clients.sort_by_key(|c| std::cmp::Reverse(c.created_at));
        recent_clients.truncate(RECENT_CLIENTS);

        Self {
            total_clients: clients.len(),
            total_documents: documents.len(),
            window_days,
            new_clients: clients.iter().filter(|c| c.created_at >= since).count(),
            new_documents: documents.iter().filter(|d| d.created_at >= since).count(),
            clients_by_kind,
            documents_by_status,
            mime_types,
            recent_clients,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    use super::*;
    use crate::db::{Address, StoredFile};

    fn client(name: &str, kind: ClientKind, created_at: DateTime<Utc>) -> ClientRecord {
        ClientRecord {
            id: Uuid::new_v4(),
            kind,
            legal_name: name.to_string(),
            tax_id: "12345678901".to_string(),
            email: "office@example.com".to_string(),
            phone: "1133334444".to_string(),
            occupation_or_activity: None,
            address: Address {
                postal_code: "01310100".to_string(),
                street: "Avenida Paulista".to_string(),
                number: "1000".to_string(),
                complement: None,
                district: "Bela Vista".to_string(),
                city: "Sao Paulo".to_string(),
                region: "SP".to_string(),
            },
            created_by: Uuid::nil(),
            created_at,
            updated_at: created_at,
        }
    }

    fn document(
        status: DocumentStatus,
        mime: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> DocumentRecord {
        DocumentRecord {
            id: Uuid::new_v4(),
            client_id: Uuid::nil(),
            client_name: None,
            title: "Contract".to_string(),
            description: None,
            file: mime.map(|m| StoredFile {
                storage_path: format!("u/{}", Uuid::new_v4()),
                original_file_name: "file".to_string(),
                byte_size: 1,
                mime_type: m.to_string(),
            }),
            status,
            tags: BTreeSet::new(),
            created_by: Uuid::nil(),
            reviewed_by: None,
            reviewed_at: None,
            created_at,
            updated_at: created_at,
        }
    }

    #[test]
    fn summary_counts_window_kinds_statuses_and_types() {
        let now = Utc::now();
        let old = now - Duration::days(40);
        let clients: Vec<ClientRecord> = (0..7)
            .map(|i| {
                let kind = if i % 2 == 0 {
                    ClientKind::Individual
                } else {
                    ClientKind::Organization
                };
                let at = if i < 2 { now - Duration::hours(i) } else { old };
                client(&format!("Client {i}"), kind, at)
            })
            .collect();
        let documents = vec![
            document(DocumentStatus::Pending, Some("application/pdf"), now),
            document(DocumentStatus::Approved, Some("application/pdf"), old),
            document(DocumentStatus::Rejected, Some("image/png"), old),
            document(DocumentStatus::Pending, None, now),
        ];

        let report = ReportSummary::build(&clients, &documents, 30, now);

        assert_eq!(report.total_clients, 7);
        assert_eq!(report.new_clients, 2);
        assert_eq!(report.new_documents, 2);
        assert_eq!(
            report.clients_by_kind,
            vec![(ClientKind::Individual, 4), (ClientKind::Organization, 3)]
        );
        assert_eq!(
            report.documents_by_status,
            vec![
                (DocumentStatus::Pending, 2),
                (DocumentStatus::InReview, 0),
                (DocumentStatus::Approved, 1),
                (DocumentStatus::Rejected, 1),
            ]
        );
        assert_eq!(report.mime_types.get("application/pdf"), Some(&2));
        assert_eq!(report.mime_types.get("image/png"), Some(&1));
        assert_eq!(report.recent_clients.len(), 5);
        assert_eq!(report.recent_clients[0].legal_name, "Client 0");
        assert_eq!(report.recent_clients[1].legal_name, "Client 1");
    }
}
