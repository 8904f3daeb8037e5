//! Field views: borrowed descriptors of the arrays taking part in an exchange.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use bytemuck::Zeroable;
use ndarray::{ArrayViewMut1, ArrayViewMut2, ArrayViewMut3};
use slotmap::Key;

use crate::device::{DeviceBufferKey, DeviceRuntime};
use crate::{Error, NDIMS};

/// Element types a field may carry.
///
/// The set is closed so that scratch buffers can be reinterpreted between
/// calls: the allocation granularity guarantees a slot sized for any of
/// these types is validly viewable as any other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElemType {
    F16,
    F32,
    F64,
    I32,
    I64,
}

impl ElemType {
    pub const fn size(self) -> usize {
        match self {
            ElemType::F16 => 2,
            ElemType::F32 | ElemType::I32 => 4,
            ElemType::F64 | ElemType::I64 => 8,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ElemType::F16 => "f16",
            ElemType::F32 => "f32",
            ElemType::F64 => "f64",
            ElemType::I32 => "i32",
            ElemType::I64 => "i64",
        }
    }
}

pub const MIN_ELEM_SIZE: usize = 2;
pub const MAX_ELEM_SIZE: usize = 8;

/// Marker for the supported element types.
pub trait Elem: bytemuck::Pod + Send + Sync + 'static {
    const ELEM: ElemType;
}

impl Elem for half::f16 {
    const ELEM: ElemType = ElemType::F16;
}
impl Elem for f32 {
    const ELEM: ElemType = ElemType::F32;
}
impl Elem for f64 {
    const ELEM: ElemType = ElemType::F64;
}
impl Elem for i32 {
    const ELEM: ElemType = ElemType::I32;
}
impl Elem for i64 {
    const ELEM: ElemType = ElemType::I64;
}

/// Dispatches a block over the concrete type behind an [`ElemType`] tag.
macro_rules! with_elem {
    ($elem:expr, $T:ident => $body:expr) => {
        match $elem {
            $crate::field::ElemType::F16 => {
                type $T = half::f16;
                $body
            }
            $crate::field::ElemType::F32 => {
                type $T = f32;
                $body
            }
            $crate::field::ElemType::F64 => {
                type $T = f64;
                $body
            }
            $crate::field::ElemType::I32 => {
                type $T = i32;
                $body
            }
            $crate::field::ElemType::I64 => {
                type $T = i64;
                $body
            }
        }
    };
}
pub(crate) use with_elem;

/// A device-resident array owned by a [`DeviceRuntime`].
///
/// Counterpart of a host `ndarray` array for fields living in GPU memory.
/// Storage is reached through the runtime; the handle itself is plain data.
#[derive(Debug)]
pub struct DeviceArray {
    runtime: Arc<dyn DeviceRuntime>,
    buf: DeviceBufferKey,
    elem: ElemType,
    shape: [usize; NDIMS],
    ndim: usize,
}

impl DeviceArray {
    /// Allocates a zero-initialized array of `shape` on `runtime`.
    pub fn zeros(
        runtime: Arc<dyn DeviceRuntime>,
        elem: ElemType,
        shape: [usize; NDIMS],
    ) -> Result<Self, Error> {
        let bytes = shape.iter().product::<usize>() * elem.size();
        let buf = runtime.alloc(bytes)?;
        Ok(Self {
            runtime,
            buf,
            elem,
            shape,
            ndim: NDIMS,
        })
    }

    /// Uploads a host array. The view must be in standard (C) layout.
    pub fn from_host<T: Elem>(
        runtime: Arc<dyn DeviceRuntime>,
        host: ndarray::ArrayView3<'_, T>,
    ) -> Result<Self, Error> {
        assert!(host.is_standard_layout());
        let shape = [host.shape()[0], host.shape()[1], host.shape()[2]];
        let arr = Self::zeros(runtime, T::ELEM, shape)?;
        let src = host.as_slice().expect("standard layout");
        arr.runtime.upload(arr.buf, 0, bytemuck::cast_slice(src))?;
        Ok(arr)
    }

    /// Downloads the array contents into a freshly allocated host array.
    pub fn to_host<T: Elem>(&self) -> Result<ndarray::Array3<T>, Error> {
        assert_eq!(T::ELEM, self.elem);
        let len = self.shape.iter().product::<usize>();
        let mut out = vec![T::zeroed(); len];
        self.runtime
            .download(self.buf, 0, bytemuck::cast_slice_mut(&mut out))?;
        Ok(ndarray::Array3::from_shape_vec(
            (self.shape[0], self.shape[1], self.shape[2]),
            out,
        )
        .expect("shape/product mismatch"))
    }

    pub fn elem(&self) -> ElemType {
        self.elem
    }

    pub fn shape(&self) -> [usize; NDIMS] {
        self.shape
    }

    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }

    pub(crate) fn buf(&self) -> DeviceBufferKey {
        self.buf
    }
}

impl Drop for DeviceArray {
    fn drop(&mut self) {
        self.runtime.free(self.buf);
    }
}

pub(crate) enum Storage<'a> {
    Host {
        ptr: NonNull<u8>,
        _marker: PhantomData<&'a mut [u8]>,
    },
    Device(&'a DeviceArray),
}

/// One field taking part in a halo update.
///
/// Borrows the caller's storage for the duration of the call. Lower-rank
/// arrays are padded with trailing size-1 axes; the last axis of a host
/// array is the contiguous one.
pub struct Field<'a> {
    elem: ElemType,
    shape: [usize; NDIMS],
    ndim: usize,
    ol: [usize; NDIMS],
    storage: Storage<'a>,
}

impl<'a> Field<'a> {
    /// Wraps a 3-D host view. Must be in standard (C) layout.
    pub fn host3<T: Elem>(mut view: ArrayViewMut3<'a, T>, ol: [usize; 3]) -> Self {
        assert!(view.is_standard_layout());
        let shape = [view.shape()[0], view.shape()[1], view.shape()[2]];
        let ptr = NonNull::new(view.as_mut_ptr() as *mut u8).expect("null view pointer");
        Self {
            elem: T::ELEM,
            shape,
            ndim: 3,
            ol,
            storage: Storage::Host {
                ptr,
                _marker: PhantomData,
            },
        }
    }

    /// Wraps a 2-D host view, padded to `[n0, n1, 1]`.
    pub fn host2<T: Elem>(mut view: ArrayViewMut2<'a, T>, ol: [usize; 2]) -> Self {
        assert!(view.is_standard_layout());
        let shape = [view.shape()[0], view.shape()[1], 1];
        let ptr = NonNull::new(view.as_mut_ptr() as *mut u8).expect("null view pointer");
        Self {
            elem: T::ELEM,
            shape,
            ndim: 2,
            ol: [ol[0], ol[1], 1],
            storage: Storage::Host {
                ptr,
                _marker: PhantomData,
            },
        }
    }

    /// Wraps a 1-D host view, padded to `[n, 1, 1]`.
    pub fn host1<T: Elem>(mut view: ArrayViewMut1<'a, T>, ol: usize) -> Self {
        assert!(view.is_standard_layout());
        let shape = [view.shape()[0], 1, 1];
        let ptr = NonNull::new(view.as_mut_ptr() as *mut u8).expect("null view pointer");
        Self {
            elem: T::ELEM,
            shape,
            ndim: 1,
            ol: [ol, 1, 1],
            storage: Storage::Host {
                ptr,
                _marker: PhantomData,
            },
        }
    }

    /// Wraps a device array.
    pub fn device(arr: &'a DeviceArray, ol: [usize; 3]) -> Self {
        Self {
            elem: arr.elem,
            shape: arr.shape,
            ndim: arr.ndim,
            ol,
            storage: Storage::Device(arr),
        }
    }

    pub fn elem(&self) -> ElemType {
        self.elem
    }

    pub fn shape(&self) -> [usize; NDIMS] {
        self.shape
    }

    pub fn ndim(&self) -> usize {
        self.ndim
    }

    /// Overlap along `dim`; the halo plane is `ol - 1` thick, so anything
    /// below 2 means the dimension carries no traffic for this field.
    pub fn ol(&self, dim: usize) -> usize {
        self.ol[dim]
    }

    pub fn is_device(&self) -> bool {
        matches!(self.storage, Storage::Device(_))
    }

    pub(crate) fn device_array(&self) -> Option<&'a DeviceArray> {
        match self.storage {
            Storage::Device(arr) => Some(arr),
            Storage::Host { .. } => None,
        }
    }

    /// Identity of the underlying storage, for the aliasing check.
    pub(crate) fn data_id(&self) -> (usize, usize) {
        match &self.storage {
            Storage::Host { ptr, .. } => (ptr.as_ptr() as usize, 0),
            Storage::Device(arr) => (
                Arc::as_ptr(&arr.runtime) as *const () as usize,
                arr.buf.data().as_ffi() as usize,
            ),
        }
    }

    /// Typed read view of a host field. Panics on device fields or on a
    /// type tag mismatch; both would be internal bugs of the orchestrator.
    pub(crate) fn host_slice<T: Elem>(&self) -> &[T] {
        assert_eq!(T::ELEM, self.elem);
        match &self.storage {
            Storage::Host { ptr, .. } => {
                let len = self.shape.iter().product();
                unsafe { std::slice::from_raw_parts(ptr.as_ptr() as *const T, len) }
            }
            Storage::Device(_) => panic!("host_slice on a device field"),
        }
    }

    pub(crate) fn host_slice_mut<T: Elem>(&mut self) -> &mut [T] {
        assert_eq!(T::ELEM, self.elem);
        match &self.storage {
            Storage::Host { ptr, .. } => {
                let len = self.shape.iter().product();
                unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr() as *mut T, len) }
            }
            Storage::Device(_) => panic!("host_slice_mut on a device field"),
        }
    }
}

impl std::fmt::Debug for Field<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field")
            .field("elem", &self.elem)
            .field("shape", &self.shape)
            .field("ol", &self.ol)
            .field("device", &self.is_device())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn host2_pads_to_three_axes() {
        let mut a = Array2::<f32>::zeros((5, 3));
        let f = Field::host2(a.view_mut(), [2, 2]);
        assert_eq!(f.shape(), [5, 3, 1]);
        assert_eq!(f.ndim(), 2);
        assert_eq!(f.ol(2), 1);
        assert_eq!(f.elem(), ElemType::F32);
    }

    #[test]
    fn granularity_covers_reinterpretation() {
        // A slot quantum holds a whole number of the largest element.
        assert_eq!(crate::ALLOC_GRANULARITY * MIN_ELEM_SIZE % MAX_ELEM_SIZE, 0);
    }
}
