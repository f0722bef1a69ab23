//! HDF5 file sink with feature flag handling.

#[cfg(feature = "storage_hdf5")]
mod hdf5_enabled {
    use crate::coerce::{TypedData, TypedValue};
    use crate::dtype::Dtype;
    use crate::error::SinkError;
    use crate::sink::{NodeId, OutputSink};
    use hdf5::types::VarLenUnicode;
    use hdf5::{Dataset, Extents, File, Group, H5Type, Location};
    use std::path::Path;
    use tracing::info;

    enum Handle {
        Group(Group),
        Dataset(Dataset),
    }

    impl Handle {
        fn location(&self) -> &Location {
            match self {
                Handle::Group(group) => group,
                Handle::Dataset(dataset) => dataset,
            }
        }
    }

    /// Writes the run tree to an HDF5 file; strings are variable-length UTF-8
    /// and booleans are stored as `u8`.
    #[derive(Default)]
    pub struct Hdf5Sink {
        file: Option<File>,
        handles: Vec<Handle>,
    }

    impl Hdf5Sink {
        pub fn new() -> Self {
            Self::default()
        }

        fn group(&self, id: NodeId) -> Result<&Group, SinkError> {
            match self.handles.get(id.0) {
                Some(Handle::Group(group)) => Ok(group),
                Some(Handle::Dataset(_)) => Err(SinkError::Backend(format!(
                    "handle {} is a dataset and cannot hold children",
                    id.0
                ))),
                None => Err(SinkError::UnknownHandle(id.0)),
            }
        }

        fn push(&mut self, handle: Handle) -> NodeId {
            self.handles.push(handle);
            NodeId(self.handles.len() - 1)
        }
    }

    fn backend(err: hdf5::Error) -> SinkError {
        SinkError::Backend(err.to_string())
    }

    fn extents(shape: &[usize]) -> Extents {
        if shape.is_empty() {
            Extents::Scalar
        } else {
            Extents::from(shape.to_vec())
        }
    }

    fn unicode(values: &[String]) -> Result<Vec<VarLenUnicode>, SinkError> {
        values
            .iter()
            .map(|text| {
                text.parse::<VarLenUnicode>()
                    .map_err(|e| SinkError::Backend(e.to_string()))
            })
            .collect()
    }

    fn write_dataset<T: H5Type>(
        parent: &Group,
        name: &str,
        shape: &[usize],
        data: &[T],
    ) -> Result<Dataset, SinkError> {
        let dataset = parent
            .new_dataset::<T>()
            .shape(extents(shape))
            .create(name)
            .map_err(backend)?;
        dataset.write_raw(data).map_err(backend)?;
        Ok(dataset)
    }

    fn write_attr<T: H5Type>(
        location: &Location,
        name: &str,
        shape: &[usize],
        data: &[T],
    ) -> Result<(), SinkError> {
        let attr = location
            .new_attr::<T>()
            .shape(extents(shape))
            .create(name)
            .map_err(backend)?;
        attr.write_raw(data).map_err(backend)?;
        Ok(())
    }

    /// Narrow the coerced storage to the declared element type and write it.
    macro_rules! write_typed {
        ($write:ident, $target:expr, $name:expr, $value:expr) => {{
            let value: &TypedValue = $value;
            let shape = value.shape.as_slice();
            match (&value.data, value.dtype) {
                (TypedData::Float(v), Dtype::Float32) => {
                    let v: Vec<f32> = v.iter().map(|x| *x as f32).collect();
                    $write($target, $name, shape, &v)
                }
                (TypedData::Float(v), _) => $write($target, $name, shape, v),
                (TypedData::Int(v), Dtype::Int8) => {
                    let v: Vec<i8> = v.iter().map(|x| *x as i8).collect();
                    $write($target, $name, shape, &v)
                }
                (TypedData::Int(v), Dtype::Int16) => {
                    let v: Vec<i16> = v.iter().map(|x| *x as i16).collect();
                    $write($target, $name, shape, &v)
                }
                (TypedData::Int(v), Dtype::Int32) => {
                    let v: Vec<i32> = v.iter().map(|x| *x as i32).collect();
                    $write($target, $name, shape, &v)
                }
                (TypedData::Int(v), _) => $write($target, $name, shape, v),
                (TypedData::UInt(v), Dtype::UInt8 | Dtype::Bool) => {
                    let v: Vec<u8> = v.iter().map(|x| *x as u8).collect();
                    $write($target, $name, shape, &v)
                }
                (TypedData::UInt(v), Dtype::UInt16) => {
                    let v: Vec<u16> = v.iter().map(|x| *x as u16).collect();
                    $write($target, $name, shape, &v)
                }
                (TypedData::UInt(v), Dtype::UInt32) => {
                    let v: Vec<u32> = v.iter().map(|x| *x as u32).collect();
                    $write($target, $name, shape, &v)
                }
                (TypedData::UInt(v), _) => $write($target, $name, shape, v),
                (TypedData::Text(v), _) => {
                    let v = unicode(v)?;
                    $write($target, $name, shape, &v)
                }
            }
        }};
    }

    impl OutputSink for Hdf5Sink {
        fn open(&mut self, path: &Path) -> Result<NodeId, SinkError> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                if !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = File::create(path).map_err(backend)?;
            let root = file.as_group().map_err(backend)?;
            self.handles.clear();
            self.file = Some(file);
            info!("HDF5 file created at '{}'", path.display());
            Ok(self.push(Handle::Group(root)))
        }

        fn create_group(&mut self, parent: NodeId, name: &str) -> Result<NodeId, SinkError> {
            let group = self.group(parent)?.create_group(name).map_err(backend)?;
            Ok(self.push(Handle::Group(group)))
        }

        fn create_dataset(
            &mut self,
            parent: NodeId,
            name: &str,
            value: &TypedValue,
        ) -> Result<NodeId, SinkError> {
            let group = self.group(parent)?;
            let dataset = write_typed!(write_dataset, group, name, value)?;
            Ok(self.push(Handle::Dataset(dataset)))
        }

        fn set_attribute(
            &mut self,
            node: NodeId,
            name: &str,
            value: &TypedValue,
        ) -> Result<(), SinkError> {
            let location = self
                .handles
                .get(node.0)
                .ok_or(SinkError::UnknownHandle(node.0))?
                .location();
            write_typed!(write_attr, location, name, value)
        }

        fn close(&mut self) -> Result<(), SinkError> {
            self.handles.clear();
            let file = self.file.take().ok_or(SinkError::Closed)?;
            file.flush().map_err(backend)?;
            Ok(())
        }
    }
}

#[cfg(feature = "storage_hdf5")]
pub use hdf5_enabled::Hdf5Sink;

#[cfg(not(feature = "storage_hdf5"))]
mod hdf5_disabled {
    use crate::coerce::TypedValue;
    use crate::error::SinkError;
    use crate::sink::{NodeId, OutputSink};
    use std::path::Path;

    pub struct Hdf5Sink;

    impl Hdf5Sink {
        pub fn new() -> Self {
            Self
        }
    }

    impl Default for Hdf5Sink {
        fn default() -> Self {
            Self::new()
        }
    }

    impl OutputSink for Hdf5Sink {
        fn open(&mut self, _path: &Path) -> Result<NodeId, SinkError> {
            Err(SinkError::FeatureNotEnabled("storage_hdf5".to_string()))
        }

        fn create_group(&mut self, _parent: NodeId, _name: &str) -> Result<NodeId, SinkError> {
            Err(SinkError::FeatureNotEnabled("storage_hdf5".to_string()))
        }

        fn create_dataset(
            &mut self,
            _parent: NodeId,
            _name: &str,
            _value: &TypedValue,
        ) -> Result<NodeId, SinkError> {
            Err(SinkError::FeatureNotEnabled("storage_hdf5".to_string()))
        }

        fn set_attribute(
            &mut self,
            _node: NodeId,
            _name: &str,
            _value: &TypedValue,
        ) -> Result<(), SinkError> {
            Err(SinkError::FeatureNotEnabled("storage_hdf5".to_string()))
        }

        fn close(&mut self) -> Result<(), SinkError> {
            Err(SinkError::FeatureNotEnabled("storage_hdf5".to_string()))
        }
    }
}

#[cfg(not(feature = "storage_hdf5"))]
pub use hdf5_disabled::Hdf5Sink;
