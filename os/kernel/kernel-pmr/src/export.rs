//! # Export and import
//!
//! Three ways to hand a resource to someone else, each holding one counted
//! reference for as long as the handle exists:
//!
//! * [`ExportToken`]: carries size, contiguity and the resource password;
//!   whoever presents all three gets a reference of their own.
//! * [`LocalImportHandle`]: an in-process handle without a password check.
//! * [`SecureExchange`]: an OS secure-handle broker owns the reference.
//!
//! Exporting fixes the physical layout for good, since importers rely on it.

use crate::device::PmrDevice;
use crate::error::PmrError;
use crate::resource::Pmr;
use log::{debug, error};

/// A counted reference that can be traded for further references.
#[derive(Debug)]
pub struct ExportToken {
    pmr: Option<Pmr>,
    size: u64,
    log2_contiguity: u32,
    password: u64,
}

impl ExportToken {
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub const fn log2_contiguity(&self) -> u32 {
        self.log2_contiguity
    }

    #[inline]
    #[must_use]
    pub const fn password(&self) -> u64 {
        self.password
    }

    /// Take a new reference on the exported resource.
    ///
    /// # Errors
    /// * [`PmrError::WrongPasswordOrStaleResource`] if `password` is not the
    ///   resource's.
    /// * [`PmrError::MismatchedAttributes`] if size or contiguity differ.
    /// * [`PmrError::RefcountOverflow`] if no reference can be taken.
    pub fn import(&self, password: u64, size: u64, log2_contiguity: u32) -> Result<Pmr, PmrError> {
        let pmr = self
            .pmr
            .as_ref()
            .ok_or(PmrError::WrongPasswordOrStaleResource)?;
        if pmr.key() != password {
            error!("PMR {}: import with wrong password", pmr.serial());
            return Err(PmrError::WrongPasswordOrStaleResource);
        }
        if pmr.logical_size() != size || pmr.log2_contiguity() != log2_contiguity {
            error!(
                "PMR {}: import expects {size:#x}/{log2_contiguity}, exported {:#x}/{}",
                pmr.serial(),
                pmr.logical_size(),
                pmr.log2_contiguity()
            );
            return Err(PmrError::MismatchedAttributes);
        }
        pmr.ref_n(1)?;
        Ok(pmr.clone())
    }

    /// Give back the token's reference.
    ///
    /// # Errors
    /// As [`Pmr::unref_and_maybe_destroy`].
    pub fn unexport(mut self) -> Result<(), PmrError> {
        self.pmr
            .take()
            .map_or(Ok(()), |pmr| pmr.unref_and_maybe_destroy(1))
    }
}

impl Drop for ExportToken {
    fn drop(&mut self) {
        if let Some(pmr) = self.pmr.take()
            && let Err(err) = pmr.unref_and_maybe_destroy(1)
        {
            error!("PMR {}: dropping export token failed: {err}", pmr.serial());
        }
    }
}

/// A counted reference handed to another part of the same process.
#[derive(Debug)]
pub struct LocalImportHandle {
    pmr: Option<Pmr>,
}

impl LocalImportHandle {
    /// Take a new reference; returns the resource with its size and
    /// alignment.
    ///
    /// # Errors
    /// [`PmrError::RefcountOverflow`] if no reference can be taken.
    pub fn local_import(&self) -> Result<(Pmr, u64, u64), PmrError> {
        let pmr = self
            .pmr
            .as_ref()
            .ok_or(PmrError::WrongPasswordOrStaleResource)?;
        pmr.ref_n(1)?;
        Ok((pmr.clone(), pmr.logical_size(), pmr.alignment()))
    }

    /// Give back the handle's reference.
    ///
    /// # Errors
    /// As [`Pmr::unref_and_maybe_destroy`].
    pub fn unmake(mut self) -> Result<(), PmrError> {
        self.pmr
            .take()
            .map_or(Ok(()), |pmr| pmr.unref_and_maybe_destroy(1))
    }
}

impl Drop for LocalImportHandle {
    fn drop(&mut self) {
        if let Some(pmr) = self.pmr.take()
            && let Err(err) = pmr.unref_and_maybe_destroy(1)
        {
            error!("PMR {}: dropping local handle failed: {err}", pmr.serial());
        }
    }
}

/// Broker of OS-level secure handles.
///
/// The broker keeps the resource reachable by handle; the reference that
/// keeps it alive is taken and released by [`Pmr::secure_export`] and
/// [`Pmr::secure_unexport`].
pub trait SecureExchange {
    type Handle: Copy;

    /// Publish `pmr` under a new handle.
    ///
    /// # Errors
    /// Broker specific.
    fn publish(&self, pmr: &Pmr) -> Result<Self::Handle, PmrError>;

    /// Resource published under `handle`.
    ///
    /// # Errors
    /// [`PmrError::WrongPasswordOrStaleResource`] for unknown handles.
    fn lookup(&self, handle: Self::Handle) -> Result<Pmr, PmrError>;

    /// Remove `handle` and return its resource.
    ///
    /// # Errors
    /// [`PmrError::WrongPasswordOrStaleResource`] for unknown handles.
    fn withdraw(&self, handle: Self::Handle) -> Result<Pmr, PmrError>;
}

impl Pmr {
    /// Export by token. Fixes the layout.
    ///
    /// # Errors
    /// [`PmrError::RefcountOverflow`] if no reference can be taken.
    pub fn export(&self) -> Result<ExportToken, PmrError> {
        self.ref_n(1)?;
        self.set_layout_fixed();
        debug!("PMR {} exported", self.serial());
        Ok(ExportToken {
            pmr: Some(self.clone()),
            size: self.logical_size(),
            log2_contiguity: self.log2_contiguity(),
            password: self.key(),
        })
    }

    /// Give back a reference obtained by [`ExportToken::import`].
    ///
    /// # Errors
    /// As [`unref_and_maybe_destroy`](Self::unref_and_maybe_destroy).
    pub fn unimport(self) -> Result<(), PmrError> {
        self.unref_and_maybe_destroy(1)
    }

    /// # Errors
    /// [`PmrError::RefcountOverflow`] if no reference can be taken.
    pub fn make_local_import_handle(&self) -> Result<LocalImportHandle, PmrError> {
        self.ref_n(1)?;
        Ok(LocalImportHandle {
            pmr: Some(self.clone()),
        })
    }

    /// Publish through a secure handle broker. Fixes the layout.
    ///
    /// # Errors
    /// Reference overflow or the broker's error; no reference is kept then.
    pub fn secure_export<X: SecureExchange>(&self, exchange: &X) -> Result<X::Handle, PmrError> {
        self.ref_n(1)?;
        match exchange.publish(self) {
            Ok(handle) => {
                self.set_layout_fixed();
                debug!("PMR {} secure exported", self.serial());
                Ok(handle)
            }
            Err(err) => {
                self.unref_and_maybe_destroy(1)?;
                Err(err)
            }
        }
    }

    /// Withdraw a secure handle and give back its reference.
    ///
    /// # Errors
    /// The broker's lookup error, or as
    /// [`unref_and_maybe_destroy`](Self::unref_and_maybe_destroy).
    pub fn secure_unexport<X: SecureExchange>(
        exchange: &X,
        handle: X::Handle,
    ) -> Result<(), PmrError> {
        exchange.withdraw(handle)?.unref_and_maybe_destroy(1)
    }

    /// Take a reference on the resource behind a secure handle, on behalf of
    /// `device`; returns the resource with its size and alignment.
    ///
    /// # Errors
    /// * The broker's lookup error.
    /// * [`PmrError::NotPermitted`] if the resource belongs to another device.
    /// * [`PmrError::RefcountOverflow`] if no reference can be taken.
    pub fn secure_import<X: SecureExchange>(
        exchange: &X,
        handle: X::Handle,
        device: &PmrDevice,
    ) -> Result<(Self, u64, u64), PmrError> {
        let pmr = exchange.lookup(handle)?;
        if pmr.device().id() != device.id() {
            error!(
                "PMR {} of {} imported for {}",
                pmr.serial(),
                pmr.device().name(),
                device.name()
            );
            return Err(PmrError::NotPermitted);
        }
        pmr.ref_n(1)?;
        let (size, align) = (pmr.logical_size(), pmr.alignment());
        Ok((pmr, size, align))
    }

    /// Give back a reference obtained by [`secure_import`](Self::secure_import).
    ///
    /// # Errors
    /// As [`unref_and_maybe_destroy`](Self::unref_and_maybe_destroy).
    pub fn secure_unimport(self) -> Result<(), PmrError> {
        self.unref_and_maybe_destroy(1)
    }
}
