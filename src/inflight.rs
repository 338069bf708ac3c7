//! Registro de ejecuciones en curso por usuario.
//!
//! Impide que dos refrescos del mismo usuario se solapen (el segundo recibe
//! `AlreadyRunning`) y permite cancelar la ejecución activa.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{FeedError, Result};
use crate::models::UserId;

/// Operaciones del pipeline que compiten por el mismo recurso.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Profile,
    Feed,
    KeywordSearch,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Profile => "generación de perfil",
            Self::Feed => "generación de feed",
            Self::KeywordSearch => "búsqueda por palabras clave",
        })
    }
}

struct Entry {
    id: Uuid,
    token: CancellationToken,
}

type Slots = HashMap<(UserId, Operation), Entry>;

#[derive(Clone, Default)]
pub struct InFlightRegistry {
    slots: Arc<Mutex<Slots>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserva el hueco `(user, op)`. Falla con `AlreadyRunning` si ya está ocupado.
    pub fn try_begin(&self, user_id: &str, op: Operation) -> Result<InFlightGuard> {
        let mut slots = self.lock()?;
        let key = (user_id.to_string(), op);
        if slots.contains_key(&key) {
            info!(user_id, operation = %op, "Ejecución rechazada: ya hay una en curso");
            return Err(FeedError::AlreadyRunning(op.to_string()));
        }

        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        slots.insert(
            key.clone(),
            Entry {
                id,
                token: token.clone(),
            },
        );
        debug!(user_id, operation = %op, %id, "Ejecución registrada");

        Ok(InFlightGuard {
            slots: Arc::clone(&self.slots),
            key,
            id,
            token,
        })
    }

    /// Cancela la ejecución en curso, si la hay. Devuelve si había alguna.
    pub fn cancel(&self, user_id: &str, op: Operation) -> Result<bool> {
        let slots = self.lock()?;
        match slots.get(&(user_id.to_string(), op)) {
            Some(entry) => {
                entry.token.cancel();
                info!(user_id, operation = %op, id = %entry.id, "Cancelación solicitada");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_running(&self, user_id: &str, op: Operation) -> Result<bool> {
        Ok(self.lock()?.contains_key(&(user_id.to_string(), op)))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Slots>> {
        self.slots
            .lock()
            .map_err(|_| FeedError::Persistence("registro de ejecuciones envenenado".to_string()))
    }
}

/// Libera el hueco al soltarse, termine como termine la ejecución.
pub struct InFlightGuard {
    slots: Arc<Mutex<Slots>>,
    key: (UserId, Operation),
    id: Uuid,
    token: CancellationToken,
}

impl InFlightGuard {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut slots) = self.slots.lock() {
            if slots.get(&self.key).is_some_and(|entry| entry.id == self.id) {
                slots.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn second_run_for_same_user_is_rejected() {
        let registry = InFlightRegistry::new();
        let _first = assert_ok!(registry.try_begin("u1", Operation::Feed));

        let err = assert_err!(registry.try_begin("u1", Operation::Feed).map(|_| ()));
        assert!(matches!(err, FeedError::AlreadyRunning(_)));

        // Otro usuario u otra operación no compiten.
        assert_ok!(registry.try_begin("u2", Operation::Feed));
        assert_ok!(registry.try_begin("u1", Operation::Profile));
    }

    #[test]
    fn dropping_the_guard_frees_the_slot() {
        let registry = InFlightRegistry::new();
        {
            let _guard = registry.try_begin("u1", Operation::Feed).unwrap();
            assert!(registry.is_running("u1", Operation::Feed).unwrap());
        }
        assert!(!registry.is_running("u1", Operation::Feed).unwrap());
        assert!(registry.try_begin("u1", Operation::Feed).is_ok());
    }

    #[test]
    fn cancel_trips_the_running_token() {
        let registry = InFlightRegistry::new();
        assert!(!registry.cancel("u1", Operation::Feed).unwrap());

        let guard = registry.try_begin("u1", Operation::Feed).unwrap();
        let token = guard.token();
        assert!(!token.is_cancelled());
        assert!(registry.cancel("u1", Operation::Feed).unwrap());
        assert!(token.is_cancelled());
    }
}
