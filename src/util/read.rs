use std::{io, io::Read};

use zerocopy::{AsBytes, FromBytes, FromZeroes};

#[inline(always)]
pub fn read_from<T, R>(reader: &mut R) -> io::Result<T>
where
    T: FromBytes + FromZeroes + AsBytes,
    R: Read + ?Sized,
{
    let mut ret = <T>::new_zeroed();
    reader.read_exact(ret.as_bytes_mut())?;
    Ok(ret)
}

#[inline(always)]
pub fn read_box_slice<T, R>(reader: &mut R, count: usize) -> io::Result<Box<[T]>>
where
    T: FromBytes + FromZeroes + AsBytes,
    R: Read + ?Sized,
{
    let mut ret = <T>::new_box_slice_zeroed(count);
    reader.read_exact(ret.as_mut().as_bytes_mut())?;
    Ok(ret)
}

#[inline(always)]
pub fn read_u16_be<R>(reader: &mut R) -> io::Result<u16>
where R: Read + ?Sized {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}
