//! Cross-session propagation through the change feed.
//!
//! Two sessions share one store. Writes made by one must show up in the
//! other without any explicit refresh, and an ended session must stop
//! following the feed.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{sleep, timeout};

use casedesk::auth::{Actor, Role};
use casedesk::db::{Address, ClientKind, CreateClientParams, DocumentStatus};
use casedesk::registry::NewUpload;
use casedesk::session::{Services, Session};

const TIMEOUT: Duration = Duration::from_secs(5);

fn client_params(name: &str, tax_id: &str) -> CreateClientParams {
    CreateClientParams {
        kind: ClientKind::Individual,
        legal_name: name.to_string(),
        tax_id: tax_id.to_string(),
        email: "contact@example.com".to_string(),
        phone: "(11) 98765-4321".to_string(),
        occupation_or_activity: None,
        address: Address {
            postal_code: "01310-100".to_string(),
            street: "Avenida Paulista".to_string(),
            number: "1000".to_string(),
            complement: None,
            district: "Bela Vista".to_string(),
            city: "Sao Paulo".to_string(),
            region: "SP".to_string(),
        },
    }
}

/// Poll until `check` holds or the timeout elapses.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    timeout(TIMEOUT, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

async fn admin_and_user(services: &Services) -> (Session, Session) {
    let admin = Session::start(
        services.clone(),
        Actor::from_email("admin@office.example", Role::Admin),
    )
    .await
    .expect("admin session");
    let user = Session::start(
        services.clone(),
        Actor::from_email("clara@office.example", Role::User),
    )
    .await
    .expect("user session");
    (admin, user)
}

#[tokio::test]
async fn client_created_in_one_session_appears_in_another() {
    let services = Services::in_memory();
    let (admin, user) = admin_and_user(&services).await;

    let created = user
        .clients()
        .create(&client_params("Clara Mendes", "123.456.789-01"))
        .await
        .expect("create");

    assert!(
        eventually(|| admin.clients().get(created.id).is_some()).await,
        "admin never saw the new client"
    );
    assert!(eventually(|| admin.stats().current().client_count == 1).await);
    assert!(
        eventually(|| admin
            .audit_trail()
            .list()
            .iter()
            .any(|e| e.record_id == created.id.to_string()))
        .await
    );

    admin.end();
    user.end();
}

#[tokio::test]
async fn review_status_flows_back_to_the_uploader() {
    let services = Services::in_memory();
    let (admin, user) = admin_and_user(&services).await;

    let client = user
        .clients()
        .create(&client_params("Clara Mendes", "123.456.789-01"))
        .await
        .expect("create client");
    let document = user
        .documents()
        .upload(NewUpload {
            client_id: client.id,
            title: "Contract".to_string(),
            description: None,
            tags: BTreeSet::from(["signed".to_string()]),
            file_name: "contract.pdf".to_string(),
            mime_type: None,
            bytes: Bytes::from_static(b"%PDF-1.7 contract"),
        })
        .await
        .expect("upload");
    assert_eq!(document.status, DocumentStatus::Pending);

    assert!(eventually(|| admin.stats().current().pending_document_count == 1).await);
    assert!(eventually(|| admin.documents().get(document.id).is_some()).await);

    admin
        .documents()
        .update_status(document.id, DocumentStatus::Approved, Some(admin.actor().id))
        .await
        .expect("approve");

    assert!(
        eventually(|| user
            .documents()
            .get(document.id)
            .is_some_and(|d| d.status == DocumentStatus::Approved))
        .await,
        "uploader never saw the review"
    );
    assert!(eventually(|| user.stats().current().pending_document_count == 0).await);

    admin.end();
    user.end();
}

#[tokio::test]
async fn ended_session_stops_following_the_feed() {
    let services = Services::in_memory();
    let (admin, user) = admin_and_user(&services).await;

    let watched = Arc::clone(admin.clients());
    admin.end();

    user.clients()
        .create(&client_params("Clara Mendes", "123.456.789-01"))
        .await
        .expect("create");
    assert_eq!(user.clients().list().len(), 1);

    sleep(Duration::from_millis(100)).await;
    assert!(watched.list().is_empty());

    user.end();
}

#[tokio::test]
async fn users_do_not_see_each_others_clients() {
    let services = Services::in_memory();
    let clara = Session::start(
        services.clone(),
        Actor::from_email("clara@office.example", Role::User),
    )
    .await
    .expect("clara");
    let davi = Session::start(
        services.clone(),
        Actor::from_email("davi@office.example", Role::User),
    )
    .await
    .expect("davi");

    clara
        .clients()
        .create(&client_params("Clara Mendes", "123.456.789-01"))
        .await
        .expect("create");
    davi.clients()
        .create(&client_params("Davi Rocha", "987.654.321-00"))
        .await
        .expect("create");

    assert!(eventually(|| davi.stats().current().client_count == 1).await);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(clara.clients().list().len(), 1);
    assert_eq!(clara.stats().current().client_count, 1);
    assert_eq!(davi.clients().list().len(), 1);
    assert_eq!(davi.clients().list()[0].legal_name, "Davi Rocha");

    clara.end();
    davi.end();
}

#[cfg(feature = "libsql")]
#[tokio::test]
async fn libsql_sessions_share_changes() {
    use casedesk::db::RemoteStore;
    use casedesk::db::libsql::LibSqlBackend;
    use casedesk::storage::MemoryObjectStore;

    let dir = tempfile::tempdir().expect("tempdir");
    let backend = LibSqlBackend::new_local(&dir.path().join("casedesk.db"))
        .await
        .expect("open");
    backend.run_migrations().await.expect("migrate");

    let services = Services {
        store: Arc::new(backend),
        objects: Arc::new(MemoryObjectStore::new()),
        ..Services::in_memory()
    };
    let (admin, user) = admin_and_user(&services).await;

    let created = user
        .clients()
        .create(&client_params("Clara Mendes", "123.456.789-01"))
        .await
        .expect("create");
    assert!(eventually(|| admin.clients().get(created.id).is_some()).await);
    assert!(eventually(|| admin.stats().current().client_count == 1).await);

    admin.end();
    user.end();
}
