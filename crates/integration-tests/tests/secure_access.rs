//! Ownership rules across services and the secure repositories

mod common;

use chrono::NaiveDate;
use common::{history_csv, Harness};
use transit_core::application::{CardRequest, IMPORT_CONTAINER};
use transit_core::domain::{CardType, ImportBatch};
use transit_core::error::AppError;
use transit_core::port::BlobStore;
use transit_core::repository::SecureQueryRepo;
use uuid::Uuid;

#[tokio::test]
async fn test_cards_are_only_visible_to_their_owner() {
    let h = Harness::new().await;
    let owner = Uuid::now_v7();
    let stranger = Uuid::now_v7();
    let card = h.add_card(owner, "GAU-2001").await;

    let mine = h.cards.list(Harness::identity(owner)).await.unwrap();
    assert_eq!(mine.len(), 1);
    assert!(h.cards.list(Harness::identity(stranger)).await.unwrap().is_empty());

    let err = h
        .cards
        .get(Harness::identity(stranger), card.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = h
        .cards
        .delete(Harness::identity(stranger), card.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = h
        .cards
        .update(
            Harness::identity(stranger),
            card.id,
            CardRequest {
                alias: "Mine now".to_string(),
                number: "GAU-2001".to_string(),
                card_type: CardType::Bronze,
                expiry_date: NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let unchanged = h.cards.get(Harness::identity(owner), card.id).await.unwrap();
    assert_eq!(unchanged, card);
}

#[tokio::test]
async fn test_card_numbers_are_unique_across_users() {
    let h = Harness::new().await;
    h.add_card(Uuid::now_v7(), "GAU-2002").await;

    let err = h
        .cards
        .create(
            Harness::identity(Uuid::now_v7()),
            CardRequest {
                alias: "Copy".to_string(),
                number: "GAU-2002".to_string(),
                card_type: CardType::Gold,
                expiry_date: NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn test_cannot_import_into_someone_elses_card() {
    let h = Harness::new().await;
    let owner = Uuid::now_v7();
    let card = h.add_card(owner, "GAU-2003").await;

    let csv = history_csv(&["1,2024-03-01,Site,Check In,0,0,0"]);
    let err = h
        .import(Uuid::now_v7(), card.id, "h.csv", &csv)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    assert!(h.blobs.list(IMPORT_CONTAINER).await.unwrap().is_empty());

    // The rejected attempt does not block the owner from importing the same file
    h.import(owner, card.id, "h.csv", &csv).await.unwrap();
}

#[tokio::test]
async fn test_import_batches_follow_card_ownership() {
    let h = Harness::new().await;
    let owner = Uuid::now_v7();
    let other = Uuid::now_v7();
    let card = h.add_card(owner, "GAU-2004").await;
    let other_card = h.add_card(other, "GAU-2005").await;

    h.import(owner, card.id, "a.csv", &history_csv(&["1,2024-03-01,A,Check In,0,0,0"]))
        .await
        .unwrap();
    h.import(owner, card.id, "b.csv", &history_csv(&["2,2024-03-02,B,Check In,0,0,0"]))
        .await
        .unwrap();
    h.import(other, other_card.id, "c.csv", &history_csv(&["3,2024-03-03,C,Check In,0,0,0"]))
        .await
        .unwrap();

    let visible = |user: Uuid| {
        let queries = SecureQueryRepo::new(
            h.store.clone(),
            Harness::identity(user),
            h.protections.clone(),
        );
        async move {
            let query = queries.secure::<ImportBatch>().unwrap();
            queries.list(&query).await.unwrap()
        }
    };

    let owned = visible(owner).await;
    assert_eq!(owned.len(), 2);
    assert!(owned.iter().all(|b| b.card_id() == card.id));

    let others = visible(other).await;
    assert_eq!(others.len(), 1);
    assert_eq!(others[0].card_id(), other_card.id);

    assert!(visible(Uuid::now_v7()).await.is_empty());
}
