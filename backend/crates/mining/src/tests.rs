//! Integration-style tests for the mining crate, run against the in-memory
//! store. Timer behaviour uses tokio's paused clock.

#[cfg(test)]
mod fixtures {
    use std::net::IpAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use rust_decimal_macros::dec;

    use crate::application::config::MiningConfig;
    use crate::application::session_manager::MiningSessionManager;
    use crate::application::settlement::SettlementService;
    use crate::domain::entities::{MiningSession, UserBalance};
    use crate::domain::repository::{AntiCheatClassifier, AntiCheatVerdict, UserBalanceRepository};
    use crate::domain::value_objects::UserId;
    use crate::error::{MiningError, MiningResult};
    use crate::infra::anti_cheat::NoPenaltyClassifier;
    use crate::infra::memory::InMemoryMiningStore;

    pub fn uid(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    /// Account created `age_days` ago
    pub fn user_aged(id: &str, age_days: i64, referred_by: Option<&str>) -> UserBalance {
        UserBalance::new(
            uid(id),
            Utc::now() - chrono::Duration::days(age_days),
            referred_by.map(uid),
        )
    }

    pub fn user(id: &str) -> UserBalance {
        user_aged(id, 0, None)
    }

    /// Multiplier 2.0 tier
    pub fn three_year_old_user(id: &str) -> UserBalance {
        user_aged(id, 3 * 366, None)
    }

    pub async fn store_with(users: Vec<UserBalance>) -> Arc<InMemoryMiningStore> {
        let store = Arc::new(InMemoryMiningStore::new());
        for user in users {
            store.create(&user).await.unwrap();
        }
        store
    }

    /// 6 currency/minute at multiplier 1, so one 1s tick is exactly 0.1
    pub fn six_per_minute() -> MiningConfig {
        MiningConfig {
            base_rate_per_minute: dec!(6),
            ..MiningConfig::default()
        }
    }

    pub fn settlement(store: &Arc<InMemoryMiningStore>) -> Arc<SettlementService<InMemoryMiningStore>> {
        Arc::new(SettlementService::new(
            store.clone(),
            Arc::new(MiningConfig::default()),
        ))
    }

    pub fn manager(
        store: &Arc<InMemoryMiningStore>,
        config: MiningConfig,
    ) -> Arc<MiningSessionManager<InMemoryMiningStore, NoPenaltyClassifier>> {
        Arc::new(MiningSessionManager::new(
            store.clone(),
            Arc::new(NoPenaltyClassifier),
            Arc::new(config),
        ))
    }

    pub fn open_session(user_id: &str) -> MiningSession {
        MiningSession::open(uid(user_id), Utc::now(), dec!(500), dec!(100))
    }

    #[derive(Debug, Clone, Copy)]
    pub enum ScriptedClassifier {
        Verdict(AntiCheatVerdict),
        Fail,
        Hang(Duration),
    }

    impl AntiCheatClassifier for ScriptedClassifier {
        async fn classify(
            &self,
            _user_id: &UserId,
            _ip: Option<IpAddr>,
        ) -> MiningResult<AntiCheatVerdict> {
            match *self {
                ScriptedClassifier::Verdict(verdict) => Ok(verdict),
                ScriptedClassifier::Fail => Err(MiningError::Internal("scripted failure".to_string())),
                ScriptedClassifier::Hang(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(AntiCheatVerdict::new(dec!(0.1), 9))
                }
            }
        }
    }
}

#[cfg(test)]
mod settlement_tests {
    use std::sync::Arc;

    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::fixtures::*;
    use crate::application::complete_task::CompleteTaskUseCase;
    use crate::domain::entities::Task;
    use crate::domain::repository::{MiningSessionRepository, UserBalanceRepository};
    use crate::domain::value_objects::{EarningType, TaskType};
    use crate::error::{ErrorClass, MiningError};
    use crate::infra::memory::StaticTaskCatalog;

    #[tokio::test]
    async fn test_referral_cascade_credits_ten_percent_with_one_log_entry() {
        let store = store_with(vec![user("alice"), user_aged("bob", 0, Some("alice"))]).await;
        let service = settlement(&store);

        let receipt = service
            .settle_task_reward(&uid("bob"), "custom-task", dec!(100))
            .await
            .unwrap();
        assert_eq!(receipt.total_reward, dec!(100));
        assert_eq!(receipt.referral_bonus, dec!(10));

        let bob = store.user(&uid("bob")).await.unwrap();
        assert_eq!(bob.current_balance, dec!(100));
        assert_eq!(bob.total_earned, dec!(100));
        assert_eq!(bob.weekly_earnings, dec!(100));
        assert_eq!(bob.monthly_earnings, dec!(100));
        assert_eq!(bob.tasks_completed, 1);
        assert!(bob.is_consistent());

        let alice = store.user(&uid("alice")).await.unwrap();
        assert_eq!(alice.current_balance, dec!(10));
        assert_eq!(alice.total_earned, dec!(10));
        assert_eq!(alice.referral_earnings, dec!(10));
        assert_eq!(alice.weekly_earnings, Decimal::ZERO);
        assert!(alice.is_consistent());

        let log = store.referral_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].referrer_id, uid("alice"));
        assert_eq!(log[0].referred_id, uid("bob"));
        assert_eq!(log[0].earning_type, EarningType::TaskCompletion);
        assert_eq!(log[0].base_amount, dec!(100));
        assert_eq!(log[0].referral_amount, dec!(10));
    }

    #[tokio::test]
    async fn test_accrual_cascade_is_tagged_mining() {
        let store = store_with(vec![user("alice"), user_aged("bob", 0, Some("alice"))]).await;
        let session = open_session("bob");
        store.open(&session).await.unwrap();

        let receipt = settlement(&store)
            .settle_accrual(&uid("bob"), session.session_id, 1, dec!(100))
            .await
            .unwrap();
        assert_eq!(receipt.referral_bonus, dec!(10));
        assert_eq!(receipt.session_earnings, dec!(100));

        assert_eq!(store.user(&uid("bob")).await.unwrap().current_balance, dec!(100));
        assert_eq!(store.user(&uid("alice")).await.unwrap().current_balance, dec!(10));
        let log = store.referral_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].earning_type, EarningType::Mining);
        assert_eq!(log[0].referral_amount, dec!(10));
    }

    #[tokio::test]
    async fn test_referral_failure_rolls_back_primary_credit() {
        let store = store_with(vec![user("alice"), user_aged("bob", 0, Some("alice"))]).await;
        let service = settlement(&store);
        let commits = store.commit_count();

        store.fail_referral_credits(true);
        let err = service
            .settle_task_reward(&uid("bob"), "custom-task", dec!(100))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let bob = store.user(&uid("bob")).await.unwrap();
        assert_eq!(bob.current_balance, Decimal::ZERO);
        assert_eq!(bob.tasks_completed, 0);
        assert!(store.task_progress(&uid("bob"), "custom-task").await.is_none());
        assert!(store.referral_log().await.is_empty());
        assert_eq!(store.commit_count(), commits);

        // same call succeeds once the cascade can be written
        store.fail_referral_credits(false);
        service
            .settle_task_reward(&uid("bob"), "custom-task", dec!(100))
            .await
            .unwrap();
        assert_eq!(store.user(&uid("bob")).await.unwrap().current_balance, dec!(100));
    }

    #[tokio::test]
    async fn test_checkpoint_sequence_is_applied_once() {
        let store = store_with(vec![user("carol")]).await;
        let session = open_session("carol");
        store.open(&session).await.unwrap();
        let service = settlement(&store);

        let first = service
            .settle_accrual(&uid("carol"), session.session_id, 1, dec!(2))
            .await
            .unwrap();
        assert!(!first.replayed);
        assert_eq!(first.session_earnings, dec!(2));

        let replay = service
            .settle_accrual(&uid("carol"), session.session_id, 1, dec!(2))
            .await
            .unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.session_earnings, dec!(2));

        let next = service
            .settle_accrual(&uid("carol"), session.session_id, 2, dec!(1))
            .await
            .unwrap();
        assert_eq!(next.session_earnings, dec!(3));

        let carol = store.user(&uid("carol")).await.unwrap();
        assert_eq!(carol.current_balance, dec!(3));
        let stored = store.session(session.session_id).await.unwrap();
        assert_eq!(stored.last_checkpoint_seq, 2);
    }

    #[tokio::test]
    async fn test_lost_acknowledgement_is_not_double_credited() {
        let store = store_with(vec![user("dave")]).await;
        let session = open_session("dave");
        store.open(&session).await.unwrap();
        let service = settlement(&store);

        store.lose_next_acks(1);
        let err = service
            .settle_accrual(&uid("dave"), session.session_id, 1, dec!(0.5))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::TransientStorage);

        let retry = service
            .settle_accrual(&uid("dave"), session.session_id, 1, dec!(0.5))
            .await
            .unwrap();
        assert!(retry.replayed);
        assert_eq!(store.user(&uid("dave")).await.unwrap().current_balance, dec!(0.5));
    }

    #[tokio::test]
    async fn test_accrual_rejects_bad_input_and_closed_sessions() {
        let store = store_with(vec![user("erin")]).await;
        let session = open_session("erin");
        store.open(&session).await.unwrap();
        let service = settlement(&store);

        let err = service
            .settle_accrual(&uid("erin"), session.session_id, 1, Decimal::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);

        let err = service
            .settle_accrual(&uid("erin"), session.session_id, 0, dec!(1))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);

        store
            .close(&uid("erin"), session.session_id, chrono::Utc::now())
            .await
            .unwrap();
        let err = service
            .settle_accrual(&uid("erin"), session.session_id, 1, dec!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MiningError::SessionNotFound));

        let err = service
            .settle_accrual(&uid("nobody"), session.session_id, 1, dec!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MiningError::UserNotFound));
    }

    #[tokio::test]
    async fn test_daily_checkin_pays_once() {
        let store = store_with(vec![user("frank")]).await;
        let use_case = CompleteTaskUseCase::new(Arc::new(StaticTaskCatalog::default()), settlement(&store));

        let receipt = use_case.execute(&uid("frank"), "daily-checkin").await.unwrap();
        assert_eq!(receipt.total_reward, dec!(10));

        let frank = store.user(&uid("frank")).await.unwrap();
        assert!(frank.daily_check_in_claimed);
        assert!(frank.last_login_time.is_some());
        assert_eq!(frank.current_balance, dec!(10));

        let err = use_case.execute(&uid("frank"), "daily-checkin").await.unwrap_err();
        assert!(matches!(err, MiningError::TaskAlreadyCompleted(_)));
        assert_eq!(err.class(), ErrorClass::Conflict);

        let frank = store.user(&uid("frank")).await.unwrap();
        assert_eq!(frank.current_balance, dec!(10));
        assert_eq!(frank.tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_task_reward_scales_with_multiplier() {
        let store = store_with(vec![three_year_old_user("gina")]).await;
        let use_case = CompleteTaskUseCase::new(Arc::new(StaticTaskCatalog::default()), settlement(&store));

        let receipt = use_case.execute(&uid("gina"), "join-discord").await.unwrap();
        assert_eq!(receipt.total_reward, dec!(50));
        assert_eq!(receipt.referral_bonus, Decimal::ZERO);

        let progress = store.task_progress(&uid("gina"), "join-discord").await.unwrap();
        assert!(progress.completed);

        let err = use_case.execute(&uid("gina"), "no-such-task").await.unwrap_err();
        assert!(matches!(err, MiningError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_completed_task_records_max_progress() {
        let store = store_with(vec![user("hilda")]).await;
        let catalog = StaticTaskCatalog::new(vec![Task {
            task_id: "watch-three-videos".to_string(),
            title: "Watch three videos".to_string(),
            base_reward: dec!(30),
            max_progress: 3,
            task_type: TaskType::Social,
        }]);
        let use_case = CompleteTaskUseCase::new(Arc::new(catalog), settlement(&store));

        use_case.execute(&uid("hilda"), "watch-three-videos").await.unwrap();
        let progress = store
            .task_progress(&uid("hilda"), "watch-three-videos")
            .await
            .unwrap();
        assert_eq!(progress.progress, 3);
        assert!(progress.completed);

        settlement(&store)
            .settle_task_reward(&uid("hilda"), "custom-task", dec!(5))
            .await
            .unwrap();
        let progress = store.task_progress(&uid("hilda"), "custom-task").await.unwrap();
        assert_eq!(progress.progress, 1);
    }

    #[tokio::test]
    async fn test_duplicate_balance_record_conflicts() {
        let store = store_with(vec![user("ines")]).await;

        let err = store.create(&user("ines")).await.unwrap_err();
        assert!(matches!(err, MiningError::UserAlreadyExists));
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert_eq!(store.user(&uid("ines")).await.unwrap().current_balance, Decimal::ZERO);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_accrual_and_task_reward_both_land() {
        for _ in 0..20 {
            let store =
                store_with(vec![user("alice"), user_aged("bob", 0, Some("alice"))]).await;
            let session = open_session("bob");
            store.open(&session).await.unwrap();
            let service = settlement(&store);

            let accrual = tokio::spawn({
                let service = service.clone();
                async move {
                    service
                        .settle_accrual(&uid("bob"), session.session_id, 1, dec!(2))
                        .await
                }
            });
            let task = tokio::spawn({
                let service = service.clone();
                async move {
                    service
                        .settle_task_reward(&uid("bob"), "custom-task", dec!(100))
                        .await
                }
            });
            let (accrual, task) = tokio::join!(accrual, task);
            assert_eq!(accrual.unwrap().unwrap().referral_bonus, dec!(0.2));
            assert_eq!(task.unwrap().unwrap().referral_bonus, dec!(10));

            let bob = store.user(&uid("bob")).await.unwrap();
            assert_eq!(bob.current_balance, dec!(102));
            assert_eq!(bob.total_earned, dec!(102));
            assert_eq!(bob.tasks_completed, 1);
            assert!(bob.is_consistent());

            let alice = store.user(&uid("alice")).await.unwrap();
            assert_eq!(alice.current_balance, dec!(10.2));
            assert_eq!(alice.referral_earnings, dec!(10.2));
            assert!(alice.is_consistent());

            let log = store.referral_log().await;
            assert_eq!(log.len(), 2);
            assert!(log.iter().any(|e| e.earning_type == EarningType::Mining));
            assert!(log.iter().any(|e| e.earning_type == EarningType::TaskCompletion));

            let stored = store.session(session.session_id).await.unwrap();
            assert_eq!(stored.earnings, dec!(2));
        }
    }
}

#[cfg(test)]
mod checkpoint_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tokio::sync::watch;

    use super::fixtures::*;
    use crate::application::checkpoint::{CheckpointFlusher, FlushOutcome, run_checkpoint_timer};
    use crate::application::config::FlushFailurePolicy;
    use crate::domain::entities::MiningSession;
    use crate::domain::repository::MiningSessionRepository;
    use crate::domain::session::SessionAccrual;
    use crate::infra::memory::InMemoryMiningStore;

    /// Session accruing `rate_per_minute` in 1s ticks
    async fn flusher_for(
        store: &Arc<InMemoryMiningStore>,
        user_id: &str,
        policy: FlushFailurePolicy,
        rate_per_minute: Decimal,
    ) -> (MiningSession, Arc<SessionAccrual>, CheckpointFlusher<InMemoryMiningStore>) {
        let session = open_session(user_id);
        store.open(&session).await.unwrap();
        let accrual = Arc::new(SessionAccrual::new(
            Decimal::ZERO,
            rate_per_minute,
            Duration::from_secs(1),
        ));
        let flusher = CheckpointFlusher::new(
            uid(user_id),
            session.session_id,
            session.last_checkpoint_seq,
            accrual.clone(),
            settlement(store),
            policy,
        );
        (session, accrual, flusher)
    }

    fn ticks(accrual: &SessionAccrual, n: u32) {
        for _ in 0..n {
            accrual.tick();
        }
    }

    #[tokio::test]
    async fn test_ten_ticks_flush_exactly_one_then_nothing() {
        let store = store_with(vec![user("hank")]).await;
        let (_, accrual, flusher) =
            flusher_for(&store, "hank", FlushFailurePolicy::Retry, dec!(6)).await;

        ticks(&accrual, 10);

        let outcome = flusher.flush().await.unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::Flushed {
                amount: dec!(1.0),
                session_earnings: dec!(1.0),
            }
        );

        let commits = store.commit_count();
        assert_eq!(flusher.flush().await.unwrap(), FlushOutcome::Skipped);
        assert_eq!(store.commit_count(), commits);
        assert_eq!(store.user(&uid("hank")).await.unwrap().current_balance, dec!(1.0));
    }

    #[tokio::test]
    async fn test_default_rate_minute_flushed_per_tick_is_exact() {
        let store = store_with(vec![user("hugo")]).await;
        let (_, accrual, flusher) =
            flusher_for(&store, "hugo", FlushFailurePolicy::Retry, dec!(0.5)).await;

        // a checkpoint every 10 ticks; 0.5/60 per tick never terminates
        for _ in 0..6 {
            ticks(&accrual, 10);
            flusher.flush().await.unwrap();
        }
        assert_eq!(store.user(&uid("hugo")).await.unwrap().current_balance, dec!(0.5));

        ticks(&accrual, 3540);
        flusher.flush().await.unwrap();
        let hugo = store.user(&uid("hugo")).await.unwrap();
        assert_eq!(hugo.current_balance, dec!(30));
        assert_eq!(hugo.total_earned, dec!(30));
    }

    #[tokio::test]
    async fn test_retry_policy_resends_failed_checkpoint() {
        // 0.25 per tick
        let store = store_with(vec![user("ivy")]).await;
        let (session, accrual, flusher) =
            flusher_for(&store, "ivy", FlushFailurePolicy::Retry, dec!(15)).await;

        store.fail_next_writes(1);
        ticks(&accrual, 2);
        assert!(flusher.flush().await.is_err());
        // still displayed while waiting for the resend
        assert_eq!(accrual.snapshot().total(), dec!(0.5));

        accrual.tick();
        let outcome = flusher.flush().await.unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::Flushed {
                amount: dec!(0.75),
                session_earnings: dec!(0.75),
            }
        );

        assert_eq!(store.user(&uid("ivy")).await.unwrap().current_balance, dec!(0.75));
        let stored = store.session(session.session_id).await.unwrap();
        assert_eq!(stored.last_checkpoint_seq, 2);
    }

    #[tokio::test]
    async fn test_retry_after_lost_ack_does_not_double_credit() {
        let store = store_with(vec![user("jack")]).await;
        let (_, accrual, flusher) =
            flusher_for(&store, "jack", FlushFailurePolicy::Retry, dec!(15)).await;

        store.lose_next_acks(1);
        ticks(&accrual, 2);
        assert!(flusher.flush().await.is_err());

        let outcome = flusher.flush().await.unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::Flushed {
                amount: dec!(0.5),
                session_earnings: dec!(0.5),
            }
        );
        assert_eq!(store.user(&uid("jack")).await.unwrap().current_balance, dec!(0.5));
        assert_eq!(accrual.snapshot().unflushed, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_drop_policy_discards_failed_interval() {
        let store = store_with(vec![user("kate")]).await;
        let (session, accrual, flusher) =
            flusher_for(&store, "kate", FlushFailurePolicy::Drop, dec!(15)).await;

        store.fail_next_writes(1);
        ticks(&accrual, 2);
        assert!(flusher.flush().await.is_err());
        assert_eq!(accrual.snapshot().total(), Decimal::ZERO);

        accrual.tick();
        flusher.flush().await.unwrap();

        assert_eq!(store.user(&uid("kate")).await.unwrap().current_balance, dec!(0.25));
        let stored = store.session(session.session_id).await.unwrap();
        assert_eq!(stored.earnings, dec!(0.25));
        assert_eq!(stored.last_checkpoint_seq, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_stops_when_session_closed_underneath() {
        let store = store_with(vec![user("kurt")]).await;
        let (session, accrual, flusher) =
            flusher_for(&store, "kurt", FlushFailurePolicy::Retry, dec!(15)).await;
        ticks(&accrual, 4);
        store.close(&uid("kurt"), session.session_id, Utc::now()).await.unwrap();
        let commits = store.commit_count();

        let (_stop, stop_rx) = watch::channel(false);
        let timer = tokio::spawn(run_checkpoint_timer(
            Arc::new(flusher),
            Duration::from_secs(10),
            stop_rx,
        ));

        // stop is never signalled; the timer has to end on its own
        tokio::time::timeout(Duration::from_secs(60), timer)
            .await
            .expect("checkpoint timer kept running after its session closed")
            .unwrap();
        assert_eq!(store.commit_count(), commits);
        assert_eq!(store.user(&uid("kurt")).await.unwrap().current_balance, Decimal::ZERO);
    }
}

#[cfg(test)]
mod session_tests {
    use std::time::Duration;

    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::fixtures::*;
    use crate::application::config::MiningConfig;
    use crate::domain::repository::MiningSessionRepository;
    use crate::domain::session::SessionPhase;
    use crate::error::{ErrorClass, MiningError};

    #[tokio::test(start_paused = true)]
    async fn test_second_start_conflicts() {
        let store = store_with(vec![user("lena")]).await;
        let manager = manager(&store, MiningConfig::default());

        manager.start(&uid("lena"), None).await.unwrap();
        let err = manager.start(&uid("lena"), None).await.unwrap_err();
        assert!(matches!(err, MiningError::SessionAlreadyActive));
        assert_eq!(err.class(), ErrorClass::Conflict);

        manager.stop(&uid("lena")).await.unwrap();
        assert_eq!(manager.phase(&uid("lena")), SessionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_conflicts_with_durable_open_session() {
        let store = store_with(vec![user("mike")]).await;
        let mut session = open_session("mike");
        session.earnings = dec!(4);
        store.open(&session).await.unwrap();
        let manager = manager(&store, MiningConfig::default());

        let err = manager.start(&uid("mike"), None).await.unwrap_err();
        assert!(matches!(err, MiningError::SessionAlreadyActive));
        assert_eq!(manager.phase(&uid("mike")), SessionPhase::Idle);

        // untracked session closes at its checkpointed earnings
        let stopped = manager.stop(&uid("mike")).await.unwrap();
        assert_eq!(stopped.session_id, session.session_id);
        assert_eq!(stopped.earnings, dec!(4));

        let mike = store.user(&uid("mike")).await.unwrap();
        assert!(!mike.is_node_active);
        assert!(mike.node_start_time.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_session_is_not_found() {
        let store = store_with(vec![user("nina")]).await;
        let manager = manager(&store, MiningConfig::default());

        let err = tokio_test::assert_err!(manager.stop(&uid("nina")).await);
        assert!(matches!(err, MiningError::NoActiveSession));
        assert_eq!(err.class(), ErrorClass::NotFound);
        assert_eq!(manager.phase(&uid("nina")), SessionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiplier_two_for_sixty_seconds_accrues_one() {
        let store = store_with(vec![three_year_old_user("owen")]).await;
        let manager = manager(&store, MiningConfig::default());

        let started = manager.start(&uid("owen"), None).await.unwrap();
        assert_eq!(started.rate.per_minute, dec!(1.0));

        tokio::time::sleep(Duration::from_millis(60_500)).await;

        let stopped = manager.stop(&uid("owen")).await.unwrap();
        assert_eq!(stopped.earnings, dec!(1.0));

        let owen = store.user(&uid("owen")).await.unwrap();
        assert_eq!(owen.current_balance, dec!(1.0));
        assert!(!owen.is_node_active);
        assert!(owen.is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_base_tier_sixty_seconds_accrues_exact_base_rate() {
        let store = store_with(vec![user("olga")]).await;
        let manager = manager(&store, MiningConfig::default());

        let started = manager.start(&uid("olga"), None).await.unwrap();
        assert_eq!(started.rate.per_minute, dec!(0.5));

        tokio::time::sleep(Duration::from_millis(60_500)).await;

        let stopped = manager.stop(&uid("olga")).await.unwrap();
        assert_eq!(stopped.earnings, dec!(0.5));
        let olga = store.user(&uid("olga")).await.unwrap();
        assert_eq!(olga.current_balance, dec!(0.5));
        assert_eq!(olga.total_earned, dec!(0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiplier_two_and_a_half_for_sixty_seconds() {
        let store = store_with(vec![user_aged("otto", 4 * 366, None)]).await;
        let manager = manager(&store, MiningConfig::default());

        let started = manager.start(&uid("otto"), None).await.unwrap();
        assert_eq!(started.rate.per_minute, dec!(1.25));

        tokio::time::sleep(Duration::from_millis(60_500)).await;

        let stopped = manager.stop(&uid("otto")).await.unwrap();
        assert_eq!(stopped.earnings, dec!(1.25));
        assert_eq!(store.user(&uid("otto")).await.unwrap().current_balance, dec!(1.25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_base_tier_one_hour_accrues_thirty() {
        let store = store_with(vec![user("oleg")]).await;
        let manager = manager(&store, MiningConfig::default());

        manager.start(&uid("oleg"), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3_600_500)).await;

        let stopped = manager.stop(&uid("oleg")).await.unwrap();
        assert_eq!(stopped.earnings, dec!(30));
        let oleg = store.user(&uid("oleg")).await.unwrap();
        assert_eq!(oleg.current_balance, dec!(30));
        assert_eq!(oleg.weekly_earnings, dec!(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_state_sums_checkpointed_and_unflushed() {
        let store = store_with(vec![user("pia")]).await;
        let manager = manager(&store, six_per_minute());

        assert!(!manager.display_state(&uid("pia")).active);
        manager.start(&uid("pia"), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        let state = manager.display_state(&uid("pia"));
        assert!(state.active);
        assert_eq!(state.phase, SessionPhase::Active);
        assert_eq!(state.current_rate, dec!(6));
        assert_eq!(state.hash_rate, dec!(6000));
        assert_eq!(state.efficiency_percent, dec!(100));
        assert_eq!(state.checkpointed_earnings, Decimal::ZERO);
        assert_eq!(state.unflushed_earnings, dec!(0.3));
        assert_eq!(state.session_earnings, dec!(0.3));

        // first checkpoint at 10s moves the accrual into the store
        tokio::time::sleep(Duration::from_secs(7)).await;
        let state = manager.display_state(&uid("pia"));
        assert!(state.checkpointed_earnings >= dec!(0.9));
        assert_eq!(state.session_earnings, dec!(1.0));

        manager.stop(&uid("pia")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stop_restores_active_session() {
        let store = store_with(vec![user("quinn")]).await;
        let manager = manager(&store, six_per_minute());

        manager.start(&uid("quinn"), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        store.fail_next_writes(1);
        let err = manager.stop(&uid("quinn")).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(manager.phase(&uid("quinn")), SessionPhase::Active);
        assert!(store.user(&uid("quinn")).await.unwrap().is_node_active);

        let stopped = manager.stop(&uid("quinn")).await.unwrap();
        assert_eq!(stopped.earnings, dec!(0.2));
        assert_eq!(manager.phase(&uid("quinn")), SessionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_without_closing() {
        let store = store_with(vec![user("rosa")]).await;
        let manager = manager(&store, six_per_minute());

        let started = manager.start(&uid("rosa"), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert_eq!(manager.shutdown().await, 1);
        assert_eq!(manager.active_count(), 0);

        let session = store.session(started.session_id).await.unwrap();
        assert!(session.is_open());
        assert_eq!(session.earnings, dec!(0.2));
        assert!(store.user(&uid("rosa")).await.unwrap().is_node_active);
    }
}

#[cfg(test)]
mod reconcile_tests {
    use std::time::Duration;

    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::fixtures::*;
    use crate::application::config::MiningConfig;
    use crate::application::reconcile::{ReconcileOutcome, ReconciliationLoader};
    use crate::domain::entities::UserBalance;
    use crate::domain::session::SessionPhase;

    fn flagged(id: &str) -> UserBalance {
        let mut user = user(id);
        user.is_node_active = true;
        user.node_start_time = Some(Utc::now() - chrono::Duration::minutes(30));
        user
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphan_flag_is_cleared_without_credit() {
        let store = store_with(vec![flagged("sam")]).await;
        let manager = manager(&store, MiningConfig::default());
        let loader = ReconciliationLoader::new(store.clone(), manager.clone());

        let outcome = loader.reconcile(&uid("sam"), None).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::OrphanFlagCleared { .. }));

        let sam = store.user(&uid("sam")).await.unwrap();
        assert!(!sam.is_node_active);
        assert!(sam.node_start_time.is_none());
        assert_eq!(sam.current_balance, Decimal::ZERO);
        assert_eq!(sam.total_earned, Decimal::ZERO);
        assert!(store.referral_log().await.is_empty());
        assert_eq!(manager.phase(&uid("sam")), SessionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_session_resumes_from_checkpoint() {
        let user = flagged("tara");
        let node_start = user.node_start_time;
        let store = store_with(vec![user]).await;
        let mut session = open_session("tara");
        session.earnings = dec!(5);
        session.last_checkpoint_seq = 3;
        store.seed_session(session.clone()).await;

        let manager = manager(&store, six_per_minute());
        let loader = ReconciliationLoader::new(store.clone(), manager.clone());

        let ReconcileOutcome::Resumed(started) = loader.reconcile(&uid("tara"), None).await.unwrap() else {
            panic!("expected resume");
        };
        assert_eq!(started.session_id, session.session_id);
        assert_eq!(Some(started.started_at), node_start);

        let state = manager.display_state(&uid("tara"));
        assert_eq!(state.checkpointed_earnings, dec!(5));

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        let stopped = manager.stop(&uid("tara")).await.unwrap();
        assert_eq!(stopped.earnings, dec!(5.2));

        let stored = store.session(session.session_id).await.unwrap();
        assert_eq!(stored.last_checkpoint_seq, 4);
        assert!(!stored.is_open());
        assert_eq!(store.user(&uid("tara")).await.unwrap().current_balance, dec!(0.2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_session_is_left_alone() {
        let store = store_with(vec![user("uma")]).await;
        let manager = manager(&store, MiningConfig::default());
        let loader = ReconciliationLoader::new(store.clone(), manager.clone());

        manager.start(&uid("uma"), None).await.unwrap();
        let commits = store.commit_count();

        let outcome = loader.reconcile(&uid("uma"), None).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::AlreadyActive);
        assert_eq!(store.commit_count(), commits);
        assert_eq!(manager.active_count(), 1);

        manager.stop(&uid("uma")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unflagged_open_session_is_closed() {
        let store = store_with(vec![user("vic")]).await;
        let mut session = open_session("vic");
        session.earnings = dec!(2.5);
        store.seed_session(session.clone()).await;

        let manager = manager(&store, MiningConfig::default());
        let loader = ReconciliationLoader::new(store.clone(), manager);

        let outcome = loader.reconcile(&uid("vic"), None).await.unwrap();
        let ReconcileOutcome::OrphanSessionClosed {
            session_id,
            earnings,
            ..
        } = outcome
        else {
            panic!("expected orphan session close");
        };
        assert_eq!(session_id, session.session_id);
        assert_eq!(earnings, dec!(2.5));
        assert!(!store.session(session.session_id).await.unwrap().is_open());
        assert_eq!(store.user(&uid("vic")).await.unwrap().current_balance, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_all_covers_every_flagged_user() {
        let store = store_with(vec![flagged("walt"), flagged("xena"), user("yara")]).await;
        store.seed_session(open_session("walt")).await;

        let manager = manager(&store, MiningConfig::default());
        let loader = ReconciliationLoader::new(store.clone(), manager.clone());

        let summary = loader.reconcile_all().await.unwrap();
        assert_eq!(summary.resumed, 1);
        assert_eq!(summary.orphans_cleared, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(manager.phase(&uid("walt")), SessionPhase::Active);
        assert_eq!(manager.phase(&uid("xena")), SessionPhase::Idle);
        assert_eq!(manager.phase(&uid("yara")), SessionPhase::Idle);

        manager.shutdown().await;
    }
}

#[cfg(test)]
mod rate_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use rust_decimal_macros::dec;

    use super::fixtures::*;
    use crate::application::config::MiningConfig;
    use crate::application::rate::RateResolver;
    use crate::domain::repository::AntiCheatVerdict;

    fn resolver(script: ScriptedClassifier) -> RateResolver<ScriptedClassifier> {
        let config = MiningConfig {
            anti_cheat_timeout: Duration::from_millis(100),
            ..MiningConfig::default()
        };
        RateResolver::new(Arc::new(script), Arc::new(config))
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_falls_back_to_full_efficiency() {
        let resolver = resolver(ScriptedClassifier::Hang(Duration::from_secs(5)));
        let rate = resolver.resolve(&three_year_old_user("zed"), None).await;
        assert_eq!(rate.efficiency.value(), dec!(1));
        assert_eq!(rate.penalty_level, 0);
        assert_eq!(rate.per_minute, dec!(1.0));
    }

    #[tokio::test]
    async fn test_classifier_error_falls_back_to_full_efficiency() {
        let resolver = resolver(ScriptedClassifier::Fail);
        let verdict = resolver.verdict(&uid("zed"), None).await;
        assert_eq!(verdict, AntiCheatVerdict::CLEAN);
    }

    #[tokio::test]
    async fn test_penalty_reduces_rate() {
        let resolver = resolver(ScriptedClassifier::Verdict(AntiCheatVerdict::new(dec!(0.5), 2)));
        let rate = resolver.resolve(&three_year_old_user("zed"), None).await;
        assert_eq!(rate.per_minute, dec!(0.5));
        assert_eq!(rate.penalty_level, 2);
        assert_eq!(rate.efficiency_percent(), dec!(50));
    }
}

#[cfg(test)]
mod error_tests {
    use axum::http::StatusCode;

    use crate::error::{ErrorClass, MiningError};
    use kernel::error::kind::ErrorKind;

    #[test]
    fn test_error_classes_map_to_status() {
        let cases = [
            (MiningError::SessionAlreadyActive, ErrorClass::Conflict, StatusCode::CONFLICT),
            (MiningError::SessionTransitionInProgress, ErrorClass::Conflict, StatusCode::CONFLICT),
            (MiningError::TaskAlreadyCompleted("t".into()), ErrorClass::Conflict, StatusCode::CONFLICT),
            (MiningError::NoActiveSession, ErrorClass::NotFound, StatusCode::NOT_FOUND),
            (MiningError::UserNotFound, ErrorClass::NotFound, StatusCode::NOT_FOUND),
            (MiningError::TaskNotFound("t".into()), ErrorClass::NotFound, StatusCode::NOT_FOUND),
            (
                MiningError::StorageUnavailable("down".into()),
                ErrorClass::TransientStorage,
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                MiningError::Validation("bad".into()),
                ErrorClass::Validation,
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                MiningError::Internal("boom".into()),
                ErrorClass::Internal,
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, class, status) in cases {
            assert_eq!(err.class(), class, "{err}");
            assert_eq!(err.status_code(), status, "{err}");
        }
    }

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(MiningError::StorageUnavailable("down".into()).is_retryable());
        assert!(MiningError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!MiningError::SessionAlreadyActive.is_retryable());
        assert!(!MiningError::Validation("bad".into()).is_retryable());
    }

    #[test]
    fn test_app_error_conversion_keeps_kind_and_action() {
        let app: kernel::error::app_error::AppError = MiningError::SessionAlreadyActive.into();
        assert_eq!(app.kind(), ErrorKind::Conflict);
        assert!(app.action().is_some());

        let app: kernel::error::app_error::AppError =
            MiningError::StorageUnavailable("down".into()).into();
        assert_eq!(app.kind(), ErrorKind::ServiceUnavailable);
        assert!(app.is_retryable());
    }

    #[test]
    fn test_row_not_found_is_not_found() {
        let err = MiningError::Database(sqlx::Error::RowNotFound);
        assert_eq!(err.class(), ErrorClass::NotFound);
    }
}

#[cfg(test)]
mod router_tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tower::ServiceExt;

    use super::fixtures::*;
    use crate::application::config::MiningConfig;
    use crate::infra::memory::StaticTaskCatalog;
    use crate::presentation::handlers::MiningAppState;
    use crate::presentation::router::mining_router;

    async fn app() -> axum::Router {
        let store = store_with(vec![user("alice"), user_aged("bob", 0, Some("alice"))]).await;
        let manager = manager(&store, MiningConfig::default());
        mining_router(MiningAppState::new(
            store,
            manager,
            Arc::new(StaticTaskCatalog::default()),
        ))
    }

    async fn send(app: &axum::Router, method: &str, uri: &str) -> Response {
        app.clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Money is serialized as a decimal string
    fn decimal(value: &serde_json::Value) -> Decimal {
        value.as_str().unwrap().parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_lifecycle_over_http() {
        let app = app().await;

        let response = send(&app, "POST", "/users/alice/session/start").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert!(body["sessionId"].is_string());
        assert_eq!(decimal(&body["efficiency"]), dec!(100));

        let response = send(&app, "POST", "/users/alice/session/start").await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = json(response).await;
        assert_eq!(body["status"], 409);
        assert_eq!(body["retryable"], false);

        let response = send(&app, "GET", "/users/alice/session").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["active"], true);
        assert_eq!(body["phase"], "active");

        let response = send(&app, "POST", "/users/alice/session/stop").await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&app, "POST", "/users/alice/session/stop").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_task_completion_over_http() {
        let app = app().await;

        let response = send(&app, "POST", "/users/bob/tasks/daily-checkin/complete").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(decimal(&body["totalReward"]), dec!(10));
        assert_eq!(decimal(&body["referralBonus"]), dec!(1));

        let response = send(&app, "POST", "/users/bob/tasks/daily-checkin/complete").await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = send(&app, "POST", "/users/bob/tasks/unknown/complete").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&app, "GET", "/tasks").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await.as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_malformed_user_id_is_rejected() {
        let app = app().await;
        let response = send(&app, "POST", "/users/has%20space/reconcile").await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let response = send(&app, "POST", "/users/nobody/reconcile").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&app, "POST", "/users/alice/reconcile").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["outcome"], "idle");
    }
}
