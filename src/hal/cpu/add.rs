use crate::{
    hal::ops::AddOp,
    loom::{
        device::{Backend, DeviceError},
        num::Float,
        ops::{TensorIr, TensorOp},
    },
};

impl<T: Float> TensorOp for AddOp<T> {
    fn io(&self) -> Vec<TensorIr> {
        self.op.io()
    }

    fn execute(&self, backend: &Backend) -> Result<(), DeviceError> {
        let [x, y] = &self.op.inputs;
        let z = &self.op.output;
        if x.desc() != y.desc() || x.desc() != z.desc() {
            let err = format!("layouts {}, {} and {} differ", x.desc(), y.desc(), z.desc());
            return Err(DeviceError::Kernel(self.name().into(), err));
        }

        #[cfg(not(feature = "rayon"))]
        let output: Vec<T> = {
            use itertools::Itertools;

            let (x, y) = (x.read(), y.read());
            let (x, y) = (x.read_slice::<T>(), y.read_slice::<T>());
            backend.install(|| x.iter().zip_eq(y.iter()).map(|(&x, &y)| x + y).collect())
        };
        #[cfg(feature = "rayon")]
        let output: Vec<T> = {
            use rayon::prelude::*;

            let (x, y) = (x.read(), y.read());
            let (x, y) = (x.read_slice::<T>(), y.read_slice::<T>());
            backend.install(|| x.par_iter().zip_eq(y.par_iter()).map(|(&x, &y)| x + y).collect())
        };

        z.write().write_slice::<T>().copy_from_slice(&output);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use half::f16;
    use itertools::Itertools;

    use crate::{
        hal::ops::{AddOp, BinaryOp},
        loom::{
            device::EngineBuilder,
            layout::{Format, LayoutDesc},
            memory::Memory,
            num::DataType,
            stream::SubmissionStream,
        },
    };

    #[test]
    fn test_add() -> Result<(), Box<dyn Error>> {
        let engine = EngineBuilder::new().build()?;
        let mut stream = SubmissionStream::new(engine);

        let desc = LayoutDesc::new([4, 3], DataType::F16, Format::Nc)?;
        let data = (0..12).map(|x| f16::from_f32(x as f32)).collect_vec();
        let x = Memory::new(desc.clone());
        let y = Memory::new(desc.clone());
        let z = Memory::new(desc.clone());
        x.write().write_slice::<f16>().copy_from_slice(&data);
        y.write().write_slice::<f16>().copy_from_slice(&data);

        let op = BinaryOp {
            inputs: [x.clone(), y],
            output: z.clone(),
        };
        stream.enqueue(AddOp::<f16>::from(op));
        let op = BinaryOp {
            inputs: [x, z.clone()],
            output: z.clone(),
        };
        // the output may not alias an input
        let aliased = stream.enqueue(AddOp::<f16>::from(op));
        assert!(stream.submit(true).is_err());
        stream.cleanup().ok();
        assert!(aliased.wait().is_err());

        let r#ref = data.iter().map(|&x| x + x).collect_vec();
        assert_eq!(z.to_vec::<f16>(), r#ref);
        Ok(())
    }

    #[test]
    fn test_add_layout_mismatch() -> Result<(), Box<dyn Error>> {
        let engine = EngineBuilder::new().build()?;
        let mut stream = SubmissionStream::new(engine.clone());

        let x = Memory::new(LayoutDesc::new([2, 8, 2, 2], DataType::F32, Format::Nchw)?);
        let y = Memory::new(LayoutDesc::new([2, 8, 2, 2], DataType::F32, Format::NChw8c)?);
        let z = Memory::new(x.desc().clone());
        let op = BinaryOp {
            inputs: [x, y],
            output: z,
        };
        let ticket = stream.enqueue(AddOp::<f32>::from(op));
        stream.submit(false)?;
        assert!(ticket.wait().is_err());
        assert!(engine.is_poisoned());
        Ok(())
    }
}
