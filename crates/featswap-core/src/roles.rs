//! The four trainable modules of the solver, by role.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetRole {
    /// Extractor for the spurious (bias) factor, `z_b`.
    BiasedF,
    /// Extractor for the intrinsic factor, `z_l`.
    DebiasedF,
    BiasedC,
    DebiasedC,
}

impl NetRole {
    pub const ALL: [NetRole; 4] = [
        NetRole::BiasedF,
        NetRole::DebiasedF,
        NetRole::BiasedC,
        NetRole::DebiasedC,
    ];

    pub fn name(self) -> &'static str {
        match self {
            NetRole::BiasedF => "biased_f",
            NetRole::DebiasedF => "debiased_f",
            NetRole::BiasedC => "biased_c",
            NetRole::DebiasedC => "debiased_c",
        }
    }
}

impl fmt::Display for NetRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One value per network role.
///
/// Fields are named rather than keyed so that code touching "all four
/// modules" fails to compile when a role is forgotten.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roles<T> {
    pub biased_f: T,
    pub debiased_f: T,
    pub biased_c: T,
    pub debiased_c: T,
}

impl<T> Roles<T> {
    pub fn from_fn(mut f: impl FnMut(NetRole) -> T) -> Self {
        Self {
            biased_f: f(NetRole::BiasedF),
            debiased_f: f(NetRole::DebiasedF),
            biased_c: f(NetRole::BiasedC),
            debiased_c: f(NetRole::DebiasedC),
        }
    }

    /// Build each slot from its role.
    pub fn try_from_fn<E>(mut f: impl FnMut(NetRole) -> Result<T, E>) -> Result<Self, E> {
        Ok(Self {
            biased_f: f(NetRole::BiasedF)?,
            debiased_f: f(NetRole::DebiasedF)?,
            biased_c: f(NetRole::BiasedC)?,
            debiased_c: f(NetRole::DebiasedC)?,
        })
    }

    pub fn get(&self, role: NetRole) -> &T {
        match role {
            NetRole::BiasedF => &self.biased_f,
            NetRole::DebiasedF => &self.debiased_f,
            NetRole::BiasedC => &self.biased_c,
            NetRole::DebiasedC => &self.debiased_c,
        }
    }

    pub fn map<U>(&self, mut f: impl FnMut(NetRole, &T) -> U) -> Roles<U> {
        Roles {
            biased_f: f(NetRole::BiasedF, &self.biased_f),
            debiased_f: f(NetRole::DebiasedF, &self.debiased_f),
            biased_c: f(NetRole::BiasedC, &self.biased_c),
            debiased_c: f(NetRole::DebiasedC, &self.debiased_c),
        }
    }

    pub fn try_map<U, E>(&self, mut f: impl FnMut(NetRole, &T) -> Result<U, E>) -> Result<Roles<U>, E> {
        Ok(Roles {
            biased_f: f(NetRole::BiasedF, &self.biased_f)?,
            debiased_f: f(NetRole::DebiasedF, &self.debiased_f)?,
            biased_c: f(NetRole::BiasedC, &self.biased_c)?,
            debiased_c: f(NetRole::DebiasedC, &self.debiased_c)?,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (NetRole, &T)> {
        [
            (NetRole::BiasedF, &self.biased_f),
            (NetRole::DebiasedF, &self.debiased_f),
            (NetRole::BiasedC, &self.biased_c),
            (NetRole::DebiasedC, &self.debiased_c),
        ]
        .into_iter()
    }

    pub fn try_for_each_mut<E>(&mut self, mut f: impl FnMut(NetRole, &mut T) -> Result<(), E>) -> Result<(), E> {
        f(NetRole::BiasedF, &mut self.biased_f)?;
        f(NetRole::DebiasedF, &mut self.debiased_f)?;
        f(NetRole::BiasedC, &mut self.biased_c)?;
        f(NetRole::DebiasedC, &mut self.debiased_c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_visit_in_fixed_order() {
        let roles = Roles::try_from_fn(|role| Ok::<_, ()>(role.name().len())).unwrap();
        let names: Vec<&str> = roles.iter().map(|(role, _)| role.name()).collect();
        assert_eq!(names, vec!["biased_f", "debiased_f", "biased_c", "debiased_c"]);
        assert_eq!(*roles.get(NetRole::DebiasedC), "debiased_c".len());
    }

    #[test]
    fn test_try_for_each_mut_stops_on_error() {
        let mut roles = Roles::<u32>::default();
        let res = roles.try_for_each_mut(|role, v| {
            if role == NetRole::BiasedC {
                return Err("stop");
            }
            *v += 1;
            Ok(())
        });
        assert_eq!(res, Err("stop"));
        assert_eq!(roles.biased_f, 1);
        assert_eq!(roles.debiased_f, 1);
        assert_eq!(roles.biased_c, 0);
        assert_eq!(roles.debiased_c, 0);
    }
}
